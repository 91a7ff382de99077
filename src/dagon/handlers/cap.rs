//! Handshake preamble: PASS, CAPAB, SVINFO and ERROR.

use slog::{info, warn};

use crate::dagon::conn::{caps, ConnId, Status};
use crate::dagon::core::Core;
use crate::dagon::msgtab::{
    mg_ignore, mg_reg, HandlerStatus, Message, MessageEntry, MsgTable,
};
use crate::dagon::topology::EntId;
use crate::dagon::wire;

pub fn register(tab: &mut MsgTable) {
    tab.add(Message::new(
        "PASS",
        [
            MessageEntry::new(mr_pass, 2),
            mg_reg(),
            mg_ignore(),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "CAPAB",
        [
            MessageEntry::new(mr_capab, 2),
            mg_ignore(),
            mg_ignore(),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "SVINFO",
        [
            mg_ignore(),
            mg_ignore(),
            MessageEntry::new(ms_svinfo, 4),
            mg_ignore(),
        ],
    ));
    tab.add(Message::new(
        "ERROR",
        [
            MessageEntry::new(mr_error, 2),
            mg_ignore(),
            MessageEntry::new(ms_error, 2),
            mg_ignore(),
        ],
    ));
}

// PASS password TS 6 :<sid>
fn mr_pass(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let conn = match core.conns.get_mut(&id.raw()) {
        Some(c) => c,
        None => return HandlerStatus::DropLine,
    };
    conn.password = Some(parv[1].to_string());
    if parv.len() > 2 && parv[2].eq_ignore_ascii_case("TS") {
        conn.caps |= caps::TS;
        if parv.len() > 4 && parv[3] == "6" {
            if !wire::valid_sid(parv[4]) {
                return HandlerStatus::DropLink("Bogus SID".to_string());
            }
            conn.offered_sid = Some(parv[4].to_string());
            conn.caps |= caps::TS6;
        }
    }
    if conn.status == Status::Unknown {
        conn.status = Status::Handshake;
    }
    HandlerStatus::Continue
}

// CAPAB :TS6 ENCAP QS ...
fn mr_capab(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let conn = match core.conns.get_mut(&id.raw()) {
        Some(c) => c,
        None => return HandlerStatus::DropLine,
    };
    let tokens = parv[1..].join(" ");
    conn.caps |= caps::parse(&tokens);
    conn.fullcaps = Some(tokens);
    if conn.status == Status::Unknown {
        conn.status = Status::Handshake;
    }
    HandlerStatus::Continue
}

// SVINFO <current> <min> 0 :<time>
fn ms_svinfo(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let current: u32 = parv[1].parse().unwrap_or(0);
    let min: u32 = parv[2].parse().unwrap_or(0);
    if current < 6 || min > 6 {
        return HandlerStatus::DropLink("Incompatible TS version".to_string());
    }
    if let Some(their_time) = parv.get(4).and_then(|t| t.parse::<i64>().ok()) {
        let delta = (core.now as i64 - their_time).abs();
        if delta > 30 {
            let name = core
                .conns
                .get(&id.raw())
                .map(|c| c.display_name().to_string())
                .unwrap_or_default();
            warn!(
                core.log,
                "Link {} clock skewed by {} seconds", name, delta
            );
        }
    }
    HandlerStatus::Continue
}

fn mr_error(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let addr = core
        .conns
        .get(&id.raw())
        .map(|c| c.addr.clone())
        .unwrap_or_default();
    info!(core.log, "ERROR :from {} -- {}", addr, parv[1]);
    HandlerStatus::DropLink(format!("ERROR: {}", parv[1]))
}

fn ms_error(core: &mut Core, id: ConnId, _src: Option<EntId>, parv: &[&str]) -> HandlerStatus {
    let name = core
        .conns
        .get(&id.raw())
        .map(|c| c.display_name().to_string())
        .unwrap_or_default();
    info!(core.log, "ERROR :from {} -- {}", name, parv[1]);
    HandlerStatus::Continue
}
