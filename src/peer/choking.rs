/// Choke and interest flags for both directions of a connection.
///
/// The two directions are independent: `am_*` describe what we told the
/// peer, `peer_*` what the peer told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ChokingState {
    /// State of a web seed: it never chokes and we never upload to it.
    pub fn web_seed() -> Self {
        Self {
            am_choking: true,
            am_interested: true,
            peer_choking: false,
            peer_interested: false,
        }
    }

    /// Whether we may send block requests right now.
    pub fn can_download(&self) -> bool {
        self.am_interested && !self.peer_choking
    }

    /// Whether we are willing to serve the peer's requests.
    pub fn can_upload(&self) -> bool {
        !self.am_choking && self.peer_interested
    }
}
