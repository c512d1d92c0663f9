use crate::CodecError;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// Vendor-specific bit: a four-byte Vendor-Id field follows the length.
pub const FLAG_VENDOR: u8 = 0x80;
/// Mandatory bit: the receiver must understand this AVP or reject.
pub const FLAG_MANDATORY: u8 = 0x40;
/// End-to-end encryption bit. Unused by the base protocol.
pub const FLAG_PROTECTED: u8 = 0x20;

const ADDRESS_FAMILY_IPV4: u16 = 1;
const ADDRESS_FAMILY_IPV6: u16 = 2;

/// A single attribute-value pair.
///
/// The typed constructors set the M-bit, which is what the base protocol
/// wants for every AVP it emits; callers that need an optional AVP can
/// clear it with [`Avp::set_mandatory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub data: Vec<u8>,
}

impl Avp {
    pub fn new(code: u32, data: Vec<u8>) -> Self {
        Avp {
            code,
            flags: FLAG_MANDATORY,
            vendor_id: None,
            data,
        }
    }

    pub fn new_u32(code: u32, value: u32) -> Self {
        Self::new(code, value.to_be_bytes().to_vec())
    }

    pub fn new_u64(code: u32, value: u64) -> Self {
        Self::new(code, value.to_be_bytes().to_vec())
    }

    pub fn new_string(code: u32, value: &str) -> Self {
        Self::new(code, value.as_bytes().to_vec())
    }

    /// An Address AVP: two-byte address family followed by the raw address.
    pub fn new_address(code: u32, addr: IpAddr) -> Self {
        let mut data = Vec::with_capacity(18);
        match addr {
            IpAddr::V4(v4) => {
                data.extend_from_slice(&ADDRESS_FAMILY_IPV4.to_be_bytes());
                data.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                data.extend_from_slice(&ADDRESS_FAMILY_IPV6.to_be_bytes());
                data.extend_from_slice(&v6.octets());
            }
        }
        Self::new(code, data)
    }

    pub fn new_grouped(code: u32, avps: &[Avp]) -> Self {
        let mut data = Vec::new();
        for avp in avps {
            avp.encode_to(&mut data);
        }
        Self::new(code, data)
    }

    pub fn with_vendor(mut self, vendor_id: u32) -> Self {
        self.flags |= FLAG_VENDOR;
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn set_mandatory(&mut self, mandatory: bool) {
        if mandatory {
            self.flags |= FLAG_MANDATORY;
        } else {
            self.flags &= !FLAG_MANDATORY;
        }
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags & FLAG_MANDATORY != 0
    }

    pub fn as_u32(&self) -> Result<u32, CodecError> {
        let bytes: [u8; 4] = self
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::WrongWidth {
                code: self.code,
                expected: 4,
                have: self.data.len(),
            })?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn as_u64(&self) -> Result<u64, CodecError> {
        let bytes: [u8; 8] = self
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::WrongWidth {
                code: self.code,
                expected: 8,
                have: self.data.len(),
            })?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn as_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.data).map_err(|_| CodecError::NotUtf8 { code: self.code })
    }

    pub fn as_address(&self) -> Result<IpAddr, CodecError> {
        if self.data.len() < 2 {
            return Err(CodecError::BadAvpLength {
                code: self.code,
                length: self.data.len() as u32,
            });
        }
        let family = u16::from_be_bytes([self.data[0], self.data[1]]);
        let raw = &self.data[2..];
        match family {
            ADDRESS_FAMILY_IPV4 => {
                let octets: [u8; 4] = raw.try_into().map_err(|_| CodecError::WrongWidth {
                    code: self.code,
                    expected: 4,
                    have: raw.len(),
                })?;
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            ADDRESS_FAMILY_IPV6 => {
                let octets: [u8; 16] = raw.try_into().map_err(|_| CodecError::WrongWidth {
                    code: self.code,
                    expected: 16,
                    have: raw.len(),
                })?;
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            family => Err(CodecError::BadAddressFamily {
                code: self.code,
                family,
            }),
        }
    }

    /// Decodes the payload as a sequence of sub-AVPs.
    pub fn as_grouped(&self) -> Result<Vec<Avp>, CodecError> {
        let mut avps = Vec::new();
        let mut offset = 0;
        while offset < self.data.len() {
            let (avp, consumed) = Avp::decode(&self.data[offset..])?;
            avps.push(avp);
            offset += consumed;
        }
        Ok(avps)
    }

    /// The wire size including header and padding.
    pub fn encoded_len(&self) -> usize {
        let header = if self.vendor_id.is_some() { 12 } else { 8 };
        let unpadded = header + self.data.len();
        (unpadded + 3) & !3
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        let header_len = if self.vendor_id.is_some() { 12 } else { 8 };
        let length = (header_len + self.data.len()) as u32;
        out.extend_from_slice(&self.code.to_be_bytes());
        out.push(self.flags);
        out.extend_from_slice(&length.to_be_bytes()[1..]);
        if let Some(vendor_id) = self.vendor_id {
            out.extend_from_slice(&vendor_id.to_be_bytes());
        }
        out.extend_from_slice(&self.data);
        for _ in 0..(4 - length as usize % 4) % 4 {
            out.push(0);
        }
    }

    /// Decodes one AVP from the front of `buf`, returning it and the
    /// number of bytes consumed (including padding).
    pub fn decode(buf: &[u8]) -> Result<(Avp, usize), CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::Truncated {
                needed: 8,
                have: buf.len(),
            });
        }
        let code = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = buf[4];
        let length = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]) as usize;
        let header_len = if flags & FLAG_VENDOR != 0 { 12 } else { 8 };
        if length < header_len {
            return Err(CodecError::BadAvpLength {
                code,
                length: length as u32,
            });
        }
        let padded = (length + 3) & !3;
        if buf.len() < padded {
            return Err(CodecError::Truncated {
                needed: padded,
                have: buf.len(),
            });
        }
        let vendor_id = if flags & FLAG_VENDOR != 0 {
            Some(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]))
        } else {
            None
        };
        let data = buf[header_len..length].to_vec();
        Ok((
            Avp {
                code,
                flags,
                vendor_id,
                data,
            },
            padded,
        ))
    }
}
