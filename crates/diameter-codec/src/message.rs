use crate::avp::Avp;
use crate::CodecError;
use crate::AVP_PROXY_INFO;
use crate::AVP_SESSION_ID;

pub const DIAMETER_VERSION: u8 = 1;

/// Request bit.
pub const FLAG_REQUEST: u8 = 0x80;
/// Proxiable bit. Preserved when answering.
pub const FLAG_PROXIABLE: u8 = 0x40;
/// Error bit. Set on answers with a protocol-error result code.
pub const FLAG_ERROR: u8 = 0x20;
/// Potentially-retransmitted bit.
pub const FLAG_RETRANSMIT: u8 = 0x10;

const HEADER_LEN: usize = 20;

/// The fixed Diameter header, minus the redundant length field which is
/// computed at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub flags: u8,
    pub code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

impl MessageHeader {
    pub fn request(code: u32, application_id: u32) -> Self {
        MessageHeader {
            flags: FLAG_REQUEST,
            code,
            application_id,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn set_error(&mut self, error: bool) {
        if error {
            self.flags |= FLAG_ERROR;
        } else {
            self.flags &= !FLAG_ERROR;
        }
    }
}

/// A decoded Diameter message: header plus the AVPs in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub avps: Vec<Avp>,
}

impl Message {
    pub fn request(code: u32, application_id: u32) -> Self {
        Message {
            header: MessageHeader::request(code, application_id),
            avps: Vec::new(),
        }
    }

    /// Prepares an answer to `request`: same command code, application id
    /// and correlation identifiers, the request bit cleared and the
    /// proxiable bit preserved. Session-Id and Proxy-Info AVPs are copied
    /// over, as every answer must return them unmodified.
    pub fn answer(request: &Message) -> Self {
        let mut header = request.header;
        header.flags = request.header.flags & FLAG_PROXIABLE;
        let mut avps = Vec::new();
        if let Some(session_id) = request.find_avp(AVP_SESSION_ID) {
            avps.push(session_id.clone());
        }
        for proxy_info in request.find_avps(AVP_PROXY_INFO) {
            avps.push(proxy_info.clone());
        }
        Message { header, avps }
    }

    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    pub fn add(&mut self, avp: Avp) -> &mut Self {
        self.avps.push(avp);
        self
    }

    pub fn find_avp(&self, code: u32) -> Option<&Avp> {
        self.avps
            .iter()
            .find(|avp| avp.code == code && avp.vendor_id.is_none())
    }

    pub fn find_avps(&self, code: u32) -> impl Iterator<Item = &Avp> {
        self.avps
            .iter()
            .filter(move |avp| avp.code == code && avp.vendor_id.is_none())
    }

    pub fn find_vendor_avp(&self, vendor_id: u32, code: u32) -> Option<&Avp> {
        self.avps
            .iter()
            .find(|avp| avp.code == code && avp.vendor_id == Some(vendor_id))
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.avps.iter().map(Avp::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = self.encoded_len() as u32;
        let mut out = Vec::with_capacity(length as usize);
        out.push(DIAMETER_VERSION);
        out.extend_from_slice(&length.to_be_bytes()[1..]);
        out.push(self.header.flags);
        out.extend_from_slice(&self.header.code.to_be_bytes()[1..]);
        out.extend_from_slice(&self.header.application_id.to_be_bytes());
        out.extend_from_slice(&self.header.hop_by_hop_id.to_be_bytes());
        out.extend_from_slice(&self.header.end_to_end_id.to_be_bytes());
        for avp in &self.avps {
            avp.encode_to(&mut out);
        }
        out
    }

    /// Reads the message length out of the four-byte frame prefix.
    ///
    /// Transports read exactly four bytes, call this, then read the
    /// remaining `length - 4` bytes and hand the whole frame to
    /// [`Message::decode`].
    pub fn read_length(prefix: [u8; 4]) -> Result<usize, CodecError> {
        if prefix[0] != DIAMETER_VERSION {
            return Err(CodecError::BadVersion(prefix[0]));
        }
        let length = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]);
        if length as usize % 4 != 0 || (length as usize) < HEADER_LEN {
            return Err(CodecError::BadMessageLength(length));
        }
        Ok(length as usize)
    }

    /// Decodes a complete frame, including the header prefix.
    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                have: buf.len(),
            });
        }
        let length = Self::read_length([buf[0], buf[1], buf[2], buf[3]])?;
        if length != buf.len() {
            return Err(CodecError::BadMessageLength(length as u32));
        }
        let header = MessageHeader {
            flags: buf[4],
            code: u32::from_be_bytes([0, buf[5], buf[6], buf[7]]),
            application_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            hop_by_hop_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            end_to_end_id: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        };
        let mut avps = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < buf.len() {
            let (avp, consumed) = Avp::decode(&buf[offset..])?;
            avps.push(avp);
            offset += consumed;
        }
        Ok(Message { header, avps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AVP_ORIGIN_HOST;
    use crate::AVP_RESULT_CODE;
    use crate::CMD_CAPABILITIES_EXCHANGE;
    use crate::RESULT_SUCCESS;

    fn sample_request() -> Message {
        let mut message = Message::request(CMD_CAPABILITIES_EXCHANGE, 0);
        message.header.hop_by_hop_id = 0xdead_beef;
        message.header.end_to_end_id = 0xcafe_babe;
        message.add(Avp::new_string(AVP_ORIGIN_HOST, "b.example"));
        message
    }

    #[test]
    fn round_trip() {
        let message = sample_request();

        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(Message::read_length(encoded[..4].try_into().unwrap()), Ok(encoded.len()));
    }

    #[test]
    fn answer_correlates_and_clears_request_bit() {
        let request = sample_request();

        let mut answer = Message::answer(&request);
        answer.add(Avp::new_u32(AVP_RESULT_CODE, RESULT_SUCCESS));

        assert!(!answer.is_request());
        assert_eq!(answer.header.code, CMD_CAPABILITIES_EXCHANGE);
        assert_eq!(answer.header.hop_by_hop_id, request.header.hop_by_hop_id);
        assert_eq!(answer.header.end_to_end_id, request.header.end_to_end_id);
    }

    #[test]
    fn answer_copies_session_id() {
        let mut request = sample_request();
        request.add(Avp::new_string(AVP_SESSION_ID, "b.example;1;2"));

        let answer = Message::answer(&request);

        assert_eq!(
            answer.find_avp(AVP_SESSION_ID).unwrap().as_str().unwrap(),
            "b.example;1;2"
        );
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut encoded = sample_request().encode();
        encoded[0] = 2;

        assert_eq!(
            Message::read_length(encoded[..4].try_into().unwrap()),
            Err(CodecError::BadVersion(2))
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut encoded = sample_request().encode();
        encoded.push(0);

        assert!(matches!(
            Message::decode(&encoded),
            Err(CodecError::BadMessageLength(_))
        ));
    }

    #[test]
    fn vendor_avps_are_not_returned_for_plain_lookup() {
        let mut message = sample_request();
        message.add(Avp::new_u32(AVP_RESULT_CODE, 1).with_vendor(10415));

        assert!(message.find_avp(AVP_RESULT_CODE).is_none());
        assert!(message.find_vendor_avp(10415, AVP_RESULT_CODE).is_some());
    }
}
