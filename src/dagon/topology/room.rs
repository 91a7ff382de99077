//! Rooms: shared conversation targets with members, modes and access
//! control masks.

use crate::dagon::collections::{self, HashMap};

/// Member holds operator status in the room.
pub const ROLE_CHANOP: u8 = 0x01;
/// Member may speak in a moderated room.
pub const ROLE_VOICE: u8 = 0x02;

/// The sigil of rooms shared across the whole mesh. Rooms with any
/// other sigil stay local and are never burst.
pub const GLOBAL_SIGIL: char = '#';

/// A room topic with attribution.
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub author: String,
    pub ts: u64,
}

/// Simple mode letters plus the parametered pair.
#[derive(Debug, Default, Clone)]
pub struct Modes {
    pub simple: String,
    pub key: Option<String>,
    pub limit: Option<u32>,
}

impl Modes {
    /// Renders the mode string the way it is burst: letters first,
    /// parameters appended in letter order.
    pub fn render(&self) -> String {
        let mut letters = String::from("+");
        letters.push_str(&self.simple);
        if self.key.is_some() {
            letters.push('k');
        }
        if self.limit.is_some() {
            letters.push('l');
        }
        if let Some(k) = &self.key {
            letters.push(' ');
            letters.push_str(k);
        }
        if let Some(l) = self.limit {
            letters.push(' ');
            letters.push_str(&l.to_string());
        }
        letters
    }
}

/// A named conversation target. Created on first join, destroyed on
/// last leave.
#[derive(Debug)]
pub struct Room {
    pub name: String,
    /// Creation timestamp; the lower value wins when two sides of a
    /// split merge.
    pub ts: u64,
    pub modes: Modes,
    /// Entity handle (raw) to role flags.
    pub members: HashMap<u64, u8>,
    pub bans: Vec<String>,
    pub excepts: Vec<String>,
    pub invex: Vec<String>,
    pub topic: Option<Topic>,
}

impl Room {
    pub fn new(name: &str, ts: u64) -> Self {
        Self {
            name: name.to_string(),
            ts,
            modes: Modes::default(),
            members: collections::hash_map(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invex: Vec::new(),
            topic: None,
        }
    }

    /// Reports whether this room is shared across the mesh.
    pub fn is_global(&self) -> bool {
        self.name.starts_with(GLOBAL_SIGIL)
    }

    /// The mask list selected by a mode letter, if it is one of the
    /// three burst lists.
    pub fn mask_list_mut(&mut self, flag: char) -> Option<&mut Vec<String>> {
        match flag {
            'b' => Some(&mut self.bans),
            'e' => Some(&mut self.excepts),
            'I' => Some(&mut self.invex),
            _ => None,
        }
    }

    pub fn mask_list(&self, flag: char) -> Option<&Vec<String>> {
        match flag {
            'b' => Some(&self.bans),
            'e' => Some(&self.excepts),
            'I' => Some(&self.invex),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_render() {
        let mut m = Modes {
            simple: "nt".to_string(),
            key: None,
            limit: None,
        };
        assert_eq!(m.render(), "+nt");
        m.key = Some("hunter2".to_string());
        m.limit = Some(25);
        assert_eq!(m.render(), "+ntkl hunter2 25");
    }

    #[test]
    fn test_global_sigil() {
        assert!(Room::new("#chat", 1).is_global());
        assert!(!Room::new("&local", 1).is_global());
    }
}
