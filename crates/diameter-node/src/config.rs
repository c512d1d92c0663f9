use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use diameter_codec::Message;
use diameter_codec::AVP_ACCT_APPLICATION_ID;
use diameter_codec::AVP_AUTH_APPLICATION_ID;
use diameter_codec::AVP_SUPPORTED_VENDOR_ID;
use diameter_codec::AVP_VENDOR_ID;
use diameter_codec::AVP_VENDOR_SPECIFIC_APPLICATION_ID;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// The IANA-assigned Diameter port.
pub const DEFAULT_PORT: u16 = 3868;

/// RFC 3539 recommends never running the watchdog faster than this.
pub(crate) const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Sctp,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => "tcp".fmt(f),
            TransportKind::Sctp => "sctp".fmt(f),
        }
    }
}

/// Whether a transport must, may, or must not be loaded on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    Required,
    Optional,
    Disabled,
}

/// Which PRNG feeds the watchdog jitter.
///
/// `Bogus` selects a non-cryptographic generator, which deviates from the
/// RFC 3539 recommendation; it exists for platforms where gathering
/// entropy per connection is too expensive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPrng {
    #[default]
    Secure,
    Bogus,
}

/// The capabilities a node advertises in CER/CEA: supported vendors and
/// the authentication/accounting applications it speaks, in plain and
/// vendor-specific form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub supported_vendors: HashSet<u32>,
    #[serde(default)]
    pub auth_apps: HashSet<u32>,
    #[serde(default)]
    pub acct_apps: HashSet<u32>,
    #[serde(default)]
    pub vendor_auth_apps: HashSet<(u32, u32)>,
    #[serde(default)]
    pub vendor_acct_apps: HashSet<(u32, u32)>,
}

impl Capability {
    pub fn is_empty(&self) -> bool {
        self.supported_vendors.is_empty()
            && self.auth_apps.is_empty()
            && self.acct_apps.is_empty()
            && self.vendor_auth_apps.is_empty()
            && self.vendor_acct_apps.is_empty()
    }

    pub fn has_auth_app(&self, app: u32) -> bool {
        self.auth_apps.contains(&app)
    }

    pub fn has_acct_app(&self, app: u32) -> bool {
        self.acct_apps.contains(&app)
    }

    pub fn has_vendor_auth_app(&self, vendor: u32, app: u32) -> bool {
        self.vendor_auth_apps.contains(&(vendor, app))
    }

    pub fn has_vendor_acct_app(&self, vendor: u32, app: u32) -> bool {
        self.vendor_acct_apps.contains(&(vendor, app))
    }

    /// The capabilities common to both sides, set by set.
    pub fn intersect(ours: &Capability, theirs: &Capability) -> Capability {
        Capability {
            supported_vendors: ours
                .supported_vendors
                .intersection(&theirs.supported_vendors)
                .copied()
                .collect(),
            auth_apps: ours.auth_apps.intersection(&theirs.auth_apps).copied().collect(),
            acct_apps: ours.acct_apps.intersection(&theirs.acct_apps).copied().collect(),
            vendor_auth_apps: ours
                .vendor_auth_apps
                .intersection(&theirs.vendor_auth_apps)
                .copied()
                .collect(),
            vendor_acct_apps: ours
                .vendor_acct_apps
                .intersection(&theirs.vendor_acct_apps)
                .copied()
                .collect(),
        }
    }

    /// Collects the capability AVPs out of a CER or CEA.
    ///
    /// Malformed entries are skipped rather than rejected; a peer that
    /// advertises nothing usable ends up with an empty capability set and
    /// fails negotiation anyway. Application id 0 (the common
    /// application) is never recorded.
    pub(crate) fn from_message(message: &Message) -> Capability {
        let mut capability = Capability::default();
        for avp in message.find_avps(AVP_SUPPORTED_VENDOR_ID) {
            if let Ok(vendor) = avp.as_u32() {
                capability.supported_vendors.insert(vendor);
            }
        }
        for avp in message.find_avps(AVP_AUTH_APPLICATION_ID) {
            match avp.as_u32() {
                Ok(0) => {}
                Ok(app) => {
                    capability.auth_apps.insert(app);
                }
                Err(_) => {}
            }
        }
        for avp in message.find_avps(AVP_ACCT_APPLICATION_ID) {
            match avp.as_u32() {
                Ok(0) => {}
                Ok(app) => {
                    capability.acct_apps.insert(app);
                }
                Err(_) => {}
            }
        }
        for avp in message.find_avps(AVP_VENDOR_SPECIFIC_APPLICATION_ID) {
            let Ok(group) = avp.as_grouped() else {
                continue;
            };
            let vendor = group
                .iter()
                .find(|avp| avp.code == AVP_VENDOR_ID)
                .and_then(|avp| avp.as_u32().ok());
            let Some(vendor) = vendor else {
                continue;
            };
            for inner in &group {
                if inner.code == AVP_AUTH_APPLICATION_ID {
                    if let Ok(app) = inner.as_u32() {
                        capability.vendor_auth_apps.insert((vendor, app));
                    }
                }
                if inner.code == AVP_ACCT_APPLICATION_ID {
                    if let Ok(app) = inner.as_u32() {
                        capability.vendor_acct_apps.insert((vendor, app));
                    }
                }
            }
        }
        capability
    }
}

/// A remote peer identity. Hostnames compare case-insensitively, so
/// `Peer` implements equality and hashing by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Peer {
            host: host.into(),
            port,
            transport: TransportKind::Tcp,
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.transport == other.transport
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.host.bytes() {
            byte.to_ascii_lowercase().hash(state);
        }
        self.port.hash(state);
        self.transport.hash(state);
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        format!("aaa://{}:{};transport={}", self.host, self.port, self.transport).fmt(f)
    }
}

impl FromStr for Peer {
    type Err = anyhow::Error;

    /// Parses `host:port`, optionally followed by `;transport=tcp|sctp`.
    fn from_str(s: &str) -> Result<Self> {
        let (address, transport) = match s.split_once(';') {
            Some((address, rest)) => {
                let transport = rest
                    .strip_prefix("transport=")
                    .with_context(|| format!("unrecognized peer parameter in {s}"))?;
                let transport = match transport {
                    "tcp" => TransportKind::Tcp,
                    "sctp" => TransportKind::Sctp,
                    other => anyhow::bail!("unknown transport {other}"),
                };
                (address, transport)
            }
            None => (s, TransportKind::Tcp),
        };
        let (host, port) = address
            .rsplit_once(':')
            .with_context(|| format!("peer {s} is missing a port"))?;
        ensure!(!host.is_empty(), "peer {s} is missing a host");
        let port = port.parse().with_context(|| format!("bad port in {s}"))?;
        Ok(Peer {
            host: host.to_string(),
            port,
            transport,
        })
    }
}

/// Everything a node needs to know about itself. Immutable once the node
/// is started.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Our Origin-Host.
    pub host_id: String,
    /// Our Origin-Realm.
    pub realm: String,
    pub vendor_id: u32,
    pub product_name: String,
    /// Advertised in CER/CEA when non-zero.
    pub firmware_revision: u32,
    /// The watchdog interval Tw. DWRs are sent with RFC 3539 jitter
    /// around this value, and a peer that stays silent for two of these
    /// is considered dead.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub watchdog_interval: Duration,
    /// A ready connection with no application traffic for this long is
    /// disconnected gracefully (DPR with cause BUSY).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
    pub capabilities: Capability,
    pub use_tcp: TransportPolicy,
    pub use_sctp: TransportPolicy,
    /// One listen port shared by every loaded transport. Zero binds an
    /// ephemeral port.
    pub listen_port: u16,
    /// Source-port range for outbound TCP connections.
    pub tcp_port_range: Option<RangeInclusive<u16>>,
    pub jitter_prng: JitterPrng,
}

impl NodeSettings {
    pub fn new(host_id: impl Into<String>, realm: impl Into<String>) -> Self {
        NodeSettings {
            host_id: host_id.into(),
            realm: realm.into(),
            vendor_id: 0,
            product_name: "diameter-node".to_string(),
            firmware_revision: 0,
            watchdog_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(7 * 24 * 3600),
            capabilities: Capability::default(),
            use_tcp: TransportPolicy::Required,
            use_sctp: TransportPolicy::Optional,
            listen_port: DEFAULT_PORT,
            tcp_port_range: None,
            jitter_prng: JitterPrng::Secure,
        }
    }

    pub(crate) fn policy_for(&self, transport: TransportKind) -> TransportPolicy {
        match transport {
            TransportKind::Tcp => self.use_tcp,
            TransportKind::Sctp => self.use_sctp,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.host_id.is_empty() && self.host_id.contains('.'),
            "host-id {:?} is not a fully qualified name",
            self.host_id
        );
        ensure!(
            !self.realm.is_empty() && self.realm.contains('.'),
            "realm {:?} is not a fully qualified name",
            self.realm
        );
        ensure!(
            self.watchdog_interval >= MIN_WATCHDOG_INTERVAL,
            "watchdog interval {:?} is below the {:?} minimum",
            self.watchdog_interval,
            MIN_WATCHDOG_INTERVAL
        );
        ensure!(
            self.idle_timeout >= self.watchdog_interval,
            "idle timeout {:?} is shorter than the watchdog interval",
            self.idle_timeout
        );
        if let Some(range) = &self.tcp_port_range {
            ensure!(!range.is_empty(), "tcp source-port range is empty");
        }
        ensure!(
            !self.capabilities.is_empty(),
            "no capabilities declared; the node could never complete a capabilities exchange"
        );
        Ok(())
    }
}
