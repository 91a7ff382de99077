//! Server wide statistics counters.

/// Counters kept by the router, listener and link layers.
#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    /// Connections accepted.
    pub is_ac: u64,
    /// Connections refused at admission.
    pub is_ref: u64,
    /// Lines with an unknown source prefix.
    pub is_unpf: u64,
    /// Lines whose resolved source arrived from the wrong direction.
    pub is_wrdi: u64,
    /// Empty lines.
    pub is_empt: u64,
    /// Numeric replies seen.
    pub is_num: u64,
    /// Unknown commands.
    pub is_unco: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}
