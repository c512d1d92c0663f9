use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Process-wide identifier generators.
///
/// Everything here is monotonic for the life of the process; none of it
/// survives a restart, which is exactly what Origin-State-Id exists to
/// signal to peers.
pub(crate) struct NodeState {
    state_id: u32,
    end_to_end: AtomicU32,
    session_part: AtomicU64,
}

impl NodeState {
    pub(crate) fn new() -> Self {
        let boot_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        // RFC 3588 §3: high 12 bits from the clock, low 20 bits random,
        // so identifiers stay unique across a fast restart.
        let end_to_end = (boot_secs & 0xfff) << 20 | rand::random::<u32>() & 0x000f_ffff;
        NodeState {
            state_id: boot_secs,
            end_to_end: AtomicU32::new(end_to_end),
            session_part: AtomicU64::new(0),
        }
    }

    /// Our Origin-State-Id.
    pub(crate) fn state_id(&self) -> u32 {
        self.state_id
    }

    pub(crate) fn next_end_to_end(&self) -> u32 {
        self.end_to_end.fetch_add(1, Ordering::Relaxed)
    }

    /// The `<high>;<low>` halves of the session sequencer. A single
    /// 64-bit counter split in two keeps the pair monotonic even when
    /// the low half rolls over.
    pub(crate) fn next_session_part(&self) -> (u32, u32) {
        let part = self.session_part.fetch_add(1, Ordering::Relaxed);
        ((part >> 32) as u32, part as u32)
    }

    pub(crate) fn make_session_id(&self, host_id: &str, optional: Option<&str>) -> String {
        let (high, low) = self.next_session_part();
        match optional {
            Some(optional) => format!("{host_id};{high};{low};{optional}"),
            None => format!("{host_id};{high};{low}"),
        }
    }
}
