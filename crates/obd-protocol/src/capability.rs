//! Supported-PID discovery
//!
//! PIDs `0x00`, `0x20`, `0x40`... answer with a 32-bit bitmap of the next
//! 32 PIDs. Bit 31 is the first PID after the bitmap PID, bit 0 the last;
//! bit 0 set means the next bitmap PID is itself supported.

use crate::client::ObdClient;
use crate::mode;
use crate::transport::Transport;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// PIDs below this are probed one by one when the car reports an empty
/// bitmap
const GUESS_END_PID: u8 = 0x52;

/// Ordered set of supported mode 01 PIDs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityBitmap {
    pids: BTreeSet<u8>,
}

impl CapabilityBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: u8) -> bool {
        self.pids.contains(&pid)
    }

    /// Returns false if `pid` was already present
    pub fn insert(&mut self, pid: u8) -> bool {
        self.pids.insert(pid)
    }

    /// Supported PIDs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.pids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Record every PID whose bit is set in a bitmap reply for `base`
    fn record_bitmap(&mut self, base: u8, bitmap: u32, wishlist: Option<&[u8]>) {
        for k in 0..32u32 {
            if bitmap & (1 << (31 - k)) == 0 {
                continue;
            }
            let pid = u32::from(base) + 1 + k;
            if let Ok(pid) = u8::try_from(pid) {
                if in_wishlist(wishlist, pid) {
                    self.insert(pid);
                }
            }
        }
    }
}

impl FromIterator<u8> for CapabilityBitmap {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        Self {
            pids: iter.into_iter().collect(),
        }
    }
}

fn in_wishlist(wishlist: Option<&[u8]>, pid: u8) -> bool {
    wishlist.map_or(true, |w| w.contains(&pid))
}

/// Ask the vehicle which mode 01 PIDs it supports.
///
/// Never fails: a request that goes wrong ends discovery with whatever
/// was found so far, so an empty or short result means "unknown", not
/// "unsupported". An all-zero first bitmap switches to probing every PID.
pub async fn discover<T: Transport>(
    client: &mut ObdClient<T>,
    wishlist: Option<&[u8]>,
) -> CapabilityBitmap {
    let mut caps = CapabilityBitmap::new();
    let mut current: u8 = 0x00;

    loop {
        let reply = client.query(mode::CURRENT_DATA, current, None).await;
        if !reply.is_success() || reply.bytes.len() != 4 {
            warn!(
                "Couldn't get capability bitmap for PID {:02X} ({})",
                current, reply.status
            );
            return caps;
        }

        let b = &reply.bytes;
        let bitmap = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        if current == 0x00 && bitmap == 0 {
            warn!("Car reported no PIDs supported. Experimentally guessing instead");
            return guess(client, wishlist, caps).await;
        }

        caps.record_bitmap(current, bitmap, wishlist);
        debug!("Bitmap {:02X}: {:08X}", current, bitmap);

        match current.checked_add(0x20) {
            Some(next) if b[3] & 0x01 != 0 => current = next,
            _ => break,
        }
    }

    info!("Discovered {} supported PIDs", caps.len());
    caps
}

async fn guess<T: Transport>(
    client: &mut ObdClient<T>,
    wishlist: Option<&[u8]>,
    mut caps: CapabilityBitmap,
) -> CapabilityBitmap {
    for pid in 0x01..GUESS_END_PID {
        if !in_wishlist(wishlist, pid) {
            continue;
        }
        let reply = client.query(mode::CURRENT_DATA, pid, None).await;
        if reply.is_success() && !reply.bytes.is_empty() {
            caps.insert(pid);
        }
    }
    info!("Guessed {} supported PIDs", caps.len());
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::ScriptedTransport;
    use crate::client::BaudSetting;

    async fn ready(transport: ScriptedTransport) -> ObdClient<ScriptedTransport> {
        let mut client = ObdClient::new(transport);
        client.open(BaudSetting::Keep, BaudSetting::Keep).await.unwrap();
        client
    }

    fn init_script() -> ScriptedTransport {
        let mut t = ScriptedTransport::new();
        t.fallback = Some("NO DATA\r\r>".to_string());
        for cmd in ["ATZ", "0100", "ATE0", "ATL0", "ATS0", "0100"] {
            t = t.expect(cmd, "OK\r\r>");
        }
        t
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitmap_without_continuation() {
        let transport = init_script().expect("0100", "41 00 FF FF FF FE\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, None).await;

        let expected: Vec<u8> = (0x01..=0x1F).collect();
        assert_eq!(caps.iter().collect::<Vec<_>>(), expected);
        assert!(!caps.contains(0x20));
        assert!(!client.into_transport().sent.contains(&"0120".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitmap_continues_to_next_block() {
        let transport = init_script()
            .expect("0100", "41 00 FF FF FF FF\r\r>")
            .expect("0120", "41 20 80 00 00 01\r\r>")
            .expect("0140", "41 40 40 00 00 00\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, None).await;

        assert!(caps.contains(0x01));
        assert!(caps.contains(0x20));
        assert!(caps.contains(0x21));
        assert!(caps.contains(0x40));
        assert!(caps.contains(0x42));
        assert!(!caps.contains(0x41));
        assert_eq!(caps.len(), 32 + 2 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wishlist_filters() {
        let transport = init_script().expect("0100", "41 00 BE 1F A8 13\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, Some(&[0x05, 0x0C, 0x0D, 0x10, 0x12])).await;
        // BE 1F A8 13: 01 03 04 05 06 07 0C 0D 0E 0F 10 11 13 15 1C 1F 20
        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![0x05, 0x0C, 0x0D, 0x10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bitmap_switches_to_guessing() {
        let transport = init_script()
            .expect("0100", "41 00 00 00 00 00\r\r>")
            .expect("0105", "41 05 7B\r\r>")
            .expect("010C", "41 0C 1A 00\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, Some(&[0x05, 0x0C, 0x0D])).await;

        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![0x05, 0x0C]);
        let sent = client.into_transport().sent;
        assert!(sent.contains(&"010D".to_string()));
        assert!(!sent.contains(&"0101".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guessing_stops_before_0x52() {
        let transport = init_script()
            .expect("0100", "41 00 00 00 00 00\r\r>")
            .expect("0151", "41 51 01\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, Some(&[0x51, 0x52])).await;

        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![0x51]);
        let sent = client.into_transport().sent;
        assert!(sent.contains(&"0151".to_string()));
        assert!(!sent.contains(&"0152".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_truncates() {
        let transport = init_script()
            .expect("0100", "41 00 80 00 00 01\r\r>")
            .expect("0120", "NO DATA\r\r>");
        let mut client = ready(transport).await;
        let caps = discover(&mut client, None).await;
        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![0x01, 0x20]);
    }

    #[test]
    fn test_set_operations() {
        let mut caps: CapabilityBitmap = [0x0C, 0x05].into_iter().collect();
        assert!(caps.insert(0x0D));
        assert!(!caps.insert(0x05));
        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![0x05, 0x0C, 0x0D]);
    }
}
