//! The topology graph: every addressable participant in the mesh.
//!
//! Entities live in a single arena addressed by stable integer
//! handles; parent pointers and children lists hold handles, never
//! references, so the cyclic server tree can be detached without
//! dangling. Three indices are kept over the arena: a case insensitive
//! name map, a wire id map, and the per room membership maps.
//!
//! The set of servers forms a tree rooted at the local node. Removing
//! a server walks its subtree bottom up, unlinking every entity from
//! the graph and from all room memberships before the parent link is
//! touched.

pub mod room;

use std::rc::Rc;

use intmap::IntMap;

use crate::dagon::collections::{self, HashMap};
use crate::dagon::conn::ConnId;
use crate::dagon::wire;

pub use room::{Room, Topic, ROLE_CHANOP, ROLE_VOICE};

/// Stable handle of an entity in the arena.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct EntId(u64);

impl EntId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for EntId {
    #[inline]
    fn from(raw: u64) -> EntId {
        EntId(raw)
    }
}

/// Server specific entity state.
#[derive(Debug, Default)]
pub struct ServerExt {
    /// Child servers hanging off this one.
    pub children: Vec<EntId>,
    /// Users attached to this server.
    pub users: Vec<EntId>,
    /// Interned upstream server name, cached at introduction.
    pub up: Option<Rc<str>>,
    /// Upstream wire id, when the upstream carries one.
    pub upid: Option<String>,
    /// The peer's advertised capability string, relayed via GCAP.
    pub fullcaps: Option<String>,
}

/// Client specific entity state.
#[derive(Debug, Default)]
pub struct ClientExt {
    pub user: String,
    pub host: String,
    pub ip: String,
    pub umodes: String,
    pub away: Option<String>,
    /// Folded names of the rooms this client is in.
    pub rooms: Vec<String>,
}

#[derive(Debug)]
pub enum EntityKind {
    Server(ServerExt),
    Client(ClientExt),
}

/// A vertex in the topology graph: a server or a user, local or
/// remote.
#[derive(Debug)]
pub struct Entity {
    pub id: EntId,
    /// Display name, unique case insensitively across the tree.
    pub name: String,
    /// Short stable wire id: three characters for a server, nine for
    /// a user. Unique across the tree when present.
    pub sid: Option<String>,
    pub info: String,
    pub hop: u32,
    pub ts: u64,
    pub hidden: bool,
    /// Parent server; `None` only for the local node.
    pub parent: Option<EntId>,
    /// The local connection this entity is reachable through; `None`
    /// for the local node itself.
    pub from: Option<ConnId>,
    pub kind: EntityKind,
}

impl Entity {
    pub fn is_server(&self) -> bool {
        matches!(self.kind, EntityKind::Server(_))
    }

    pub fn is_client(&self) -> bool {
        matches!(self.kind, EntityKind::Client(_))
    }

    pub fn serv(&self) -> Option<&ServerExt> {
        match &self.kind {
            EntityKind::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn serv_mut(&mut self) -> Option<&mut ServerExt> {
        match &mut self.kind {
            EntityKind::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn client(&self) -> Option<&ClientExt> {
        match &self.kind {
            EntityKind::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn client_mut(&mut self) -> Option<&mut ClientExt> {
        match &mut self.kind {
            EntityKind::Client(c) => Some(c),
            _ => None,
        }
    }

    /// The wire token peers that understand ids should see.
    pub fn wire_id(&self) -> &str {
        self.sid.as_deref().unwrap_or(&self.name)
    }

    /// `user@host` identity of a client.
    pub fn identity(&self) -> Option<(&str, &str)> {
        self.client().map(|c| (c.user.as_str(), c.host.as_str()))
    }
}

/// Attributes of a client about to be introduced.
pub struct NewClient {
    /// The server the client sits on.
    pub server: EntId,
    pub nick: String,
    pub hop: u32,
    pub ts: u64,
    pub umodes: String,
    pub user: String,
    pub host: String,
    pub ip: String,
    pub uid: Option<String>,
    pub info: String,
    pub from: Option<ConnId>,
}

/// Outcome of a client introduction, after collision resolution.
///
/// The tiebreak is observable across the whole mesh and must not be
/// reordered: the older timestamp wins; on an exact tie, identical
/// user@host identities keep the incumbent, while differing identities
/// remove both sides.
pub enum Introduction {
    /// No collision; the client is in the graph.
    Added(EntId),
    /// The newcomer lost; nothing was added.
    KeepExisting(EntId),
    /// The incumbent lost and was removed; the newcomer is in.
    Replaced { killed: Entity, added: EntId },
    /// Equal timestamps, differing identities: the incumbent was
    /// removed, the newcomer is not added.
    KillBoth { killed: Entity },
    /// The nick is already the name of a server.
    ServerCollision(EntId),
}

/// Entities removed by a subtree deletion, bottom up.
#[derive(Default)]
pub struct RemovedSubtree {
    pub servers: Vec<Entity>,
    pub clients: Vec<Entity>,
}

/// The graph itself: arena plus indices plus the room table.
pub struct Topology {
    arena: IntMap<Entity>,
    next: u64,
    name_index: HashMap<String, EntId>,
    id_index: HashMap<String, EntId>,
    /// The local node.
    pub me: EntId,
    /// Every server in the tree, the local node included.
    pub global_servers: Vec<EntId>,
    /// Every client in the tree.
    pub global_clients: Vec<EntId>,
    pub rooms: HashMap<String, Room>,
}

impl Topology {
    /// Creates the graph holding just the local node.
    pub fn new(name: &str, sid: &str, info: &str) -> Self {
        let mut topo = Self {
            arena: IntMap::new(),
            next: 1,
            name_index: collections::hash_map(),
            id_index: collections::hash_map(),
            me: EntId(0),
            global_servers: Vec::new(),
            global_clients: Vec::new(),
            rooms: collections::hash_map(),
        };
        let me = topo.alloc(Entity {
            id: EntId(0),
            name: name.to_string(),
            sid: Some(sid.to_string()),
            info: info.to_string(),
            hop: 0,
            ts: 0,
            hidden: false,
            parent: None,
            from: None,
            kind: EntityKind::Server(ServerExt::default()),
        });
        topo.me = me;
        topo.global_servers.push(me);
        topo
    }

    fn alloc(&mut self, mut ent: Entity) -> EntId {
        let id = EntId(self.next);
        self.next += 1;
        ent.id = id;
        self.name_index.insert(wire::fold(&ent.name), id);
        if let Some(sid) = &ent.sid {
            self.id_index.insert(sid.clone(), id);
        }
        self.arena.insert(id.raw(), ent);
        id
    }

    pub fn get(&self, id: EntId) -> Option<&Entity> {
        self.arena.get(id.raw())
    }

    pub fn get_mut(&mut self, id: EntId) -> Option<&mut Entity> {
        self.arena.get_mut(id.raw())
    }

    /// Looks an entity up by display name.
    pub fn find_name(&self, name: &str) -> Option<EntId> {
        self.name_index.get(&wire::fold(name)).copied()
    }

    /// Looks an entity up by wire id.
    pub fn find_id(&self, id: &str) -> Option<EntId> {
        self.id_index.get(id).copied()
    }

    /// Looks a source token up: digit led tokens are wire ids,
    /// anything else is a name.
    pub fn find_any(&self, token: &str) -> Option<EntId> {
        if token.as_bytes().first().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.find_id(token)
        } else {
            self.find_name(token)
        }
    }

    /// Finds a server whose name masks against `name`, in either
    /// direction.
    pub fn server_exists(&self, name: &str) -> Option<EntId> {
        for &h in self.global_servers.iter() {
            let ent = self.get(h).expect("server list entry in arena");
            if wire::mask_match(&ent.name, name) || wire::mask_match(name, &ent.name) {
                return Some(h);
            }
        }
        None
    }

    /// Adds a server under `parent`. Name and id uniqueness are the
    /// caller's to enforce; this only wires the graph up.
    pub fn add_server(
        &mut self,
        parent: EntId,
        from: Option<ConnId>,
        name: &str,
        sid: Option<String>,
        hop: u32,
        info: &str,
        hidden: bool,
    ) -> EntId {
        debug_assert!(self.find_name(name).is_none());
        let id = self.alloc(Entity {
            id: EntId(0),
            name: name.to_string(),
            sid,
            info: info.to_string(),
            hop,
            ts: 0,
            hidden,
            parent: Some(parent),
            from,
            kind: EntityKind::Server(ServerExt::default()),
        });
        self.global_servers.push(id);
        if let Some(p) = self.get_mut(parent).and_then(Entity::serv_mut) {
            p.children.push(id);
        }
        id
    }

    /// Adds a client under its server unconditionally.
    fn add_client(&mut self, c: NewClient) -> EntId {
        let id = self.alloc(Entity {
            id: EntId(0),
            name: c.nick,
            sid: c.uid,
            info: c.info,
            hop: c.hop,
            ts: c.ts,
            hidden: false,
            parent: Some(c.server),
            from: c.from,
            kind: EntityKind::Client(ClientExt {
                user: c.user,
                host: c.host,
                ip: c.ip,
                umodes: c.umodes,
                away: None,
                rooms: Vec::new(),
            }),
        });
        self.global_clients.push(id);
        if let Some(p) = self.get_mut(c.server).and_then(Entity::serv_mut) {
            p.users.push(id);
        }
        id
    }

    /// Introduces a client, resolving any nick collision.
    pub fn introduce_client(&mut self, c: NewClient) -> Introduction {
        let existing = match self.find_name(&c.nick) {
            None => {
                if let Some(uid) = &c.uid {
                    if let Some(other) = self.find_id(uid) {
                        // colliding wire id with a fresh nick; the
                        // newcomer cannot be addressed, drop it
                        return Introduction::KeepExisting(other);
                    }
                }
                return Introduction::Added(self.add_client(c));
            }
            Some(h) => h,
        };

        let ex = self.get(existing).expect("name index entry in arena");
        if ex.is_server() {
            return Introduction::ServerCollision(existing);
        }

        if c.ts < ex.ts {
            let killed = self.remove_client(existing).expect("collided client");
            let added = self.add_client(c);
            Introduction::Replaced { killed, added }
        } else if c.ts > ex.ts {
            Introduction::KeepExisting(existing)
        } else {
            let same_identity = ex
                .identity()
                .map(|(u, h)| wire::name_eq(u, &c.user) && wire::name_eq(h, &c.host))
                .unwrap_or(false);
            if same_identity {
                // the newcomer arrived through the less preferred
                // route; the incumbent stays
                Introduction::KeepExisting(existing)
            } else {
                let killed = self.remove_client(existing).expect("collided client");
                Introduction::KillBoth { killed }
            }
        }
    }

    /// Renames a client in place, updating the name index and the
    /// nick timestamp. The new name must be free.
    pub fn rename_client(&mut self, id: EntId, new_nick: &str, ts: u64) {
        let old_key = match self.get(id) {
            Some(e) => wire::fold(&e.name),
            None => return,
        };
        debug_assert!({
            let taken = self.find_name(new_nick);
            taken.is_none() || taken == Some(id)
        });
        self.name_index.remove(&old_key);
        self.name_index.insert(wire::fold(new_nick), id);
        if let Some(e) = self.get_mut(id) {
            e.name = new_nick.to_string();
            e.ts = ts;
        }
    }

    /// Unlinks a client from the graph, its server, and every room.
    pub fn remove_client(&mut self, id: EntId) -> Option<Entity> {
        let ent = self.arena.remove(id.raw())?;
        self.name_index.remove(&wire::fold(&ent.name));
        if let Some(sid) = &ent.sid {
            self.id_index.remove(sid);
        }
        self.global_clients.retain(|&h| h != id);
        if let Some(parent) = ent.parent {
            if let Some(p) = self.get_mut(parent).and_then(Entity::serv_mut) {
                p.users.retain(|&h| h != id);
            }
        }
        if let Some(c) = ent.client() {
            for key in c.rooms.iter() {
                let emptied = match self.rooms.get_mut(key) {
                    Some(room) => {
                        room.members.remove(&id.raw());
                        room.members.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.rooms.remove(key);
                }
            }
        }
        Some(ent)
    }

    fn unlink_server(&mut self, id: EntId) -> Option<Entity> {
        let ent = self.arena.remove(id.raw())?;
        self.name_index.remove(&wire::fold(&ent.name));
        if let Some(sid) = &ent.sid {
            self.id_index.remove(sid);
        }
        self.global_servers.retain(|&h| h != id);
        if let Some(parent) = ent.parent {
            if let Some(p) = self.get_mut(parent).and_then(Entity::serv_mut) {
                p.children.retain(|&h| h != id);
            }
        }
        Some(ent)
    }

    /// Deletes a server and everything beneath it, bottom up. The
    /// local node cannot be removed.
    pub fn remove_server(&mut self, root: EntId) -> RemovedSubtree {
        let mut out = RemovedSubtree::default();
        if root == self.me {
            debug_assert!(false, "attempted removal of the local node");
            return out;
        }

        let mut order = vec![root];
        let mut i = 0;
        while i < order.len() {
            if let Some(ext) = self.get(order[i]).and_then(Entity::serv) {
                order.extend_from_slice(&ext.children);
            }
            i += 1;
        }

        for &server in order.iter().rev() {
            let users = self
                .get(server)
                .and_then(Entity::serv)
                .map(|s| s.users.clone())
                .unwrap_or_default();
            for user in users {
                if let Some(ent) = self.remove_client(user) {
                    out.clients.push(ent);
                }
            }
            if let Some(ent) = self.unlink_server(server) {
                out.servers.push(ent);
            }
        }
        out
    }

    /// Joins a client to a room, creating the room on first join.
    /// Returns whether the membership is new.
    pub fn join_room(&mut self, name: &str, ts: u64, ent: EntId, flags: u8) -> bool {
        let key = wire::fold(name);
        let room = self
            .rooms
            .entry(key.clone())
            .or_insert_with(|| Room::new(name, ts));
        if room.members.insert(ent.raw(), flags).is_some() {
            return false;
        }
        if let Some(c) = self.get_mut(ent).and_then(Entity::client_mut) {
            if !c.rooms.contains(&key) {
                c.rooms.push(key);
            }
        }
        true
    }

    /// Removes a client from a room; the room dies with its last
    /// member.
    pub fn part_room(&mut self, name: &str, ent: EntId) {
        let key = wire::fold(name);
        let emptied = match self.rooms.get_mut(&key) {
            Some(room) => {
                room.members.remove(&ent.raw());
                room.members.is_empty()
            }
            None => return,
        };
        if let Some(c) = self.get_mut(ent).and_then(Entity::client_mut) {
            c.rooms.retain(|k| k != &key);
        }
        if emptied {
            self.rooms.remove(&key);
        }
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(&wire::fold(name))
    }

    pub fn room_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(&wire::fold(name))
    }

    /// Checks the structural invariants of the graph; test support.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for (name, &h) in self.name_index.iter() {
            let ent = self.get(h).expect("name index entry in arena");
            assert_eq!(&wire::fold(&ent.name), name);
        }
        for (sid, &h) in self.id_index.iter() {
            let ent = self.get(h).expect("id index entry in arena");
            assert_eq!(ent.sid.as_deref(), Some(sid.as_str()));
        }
        for &h in self.global_servers.iter().chain(self.global_clients.iter()) {
            let ent = self.get(h).expect("global list entry in arena");
            assert_eq!(self.find_name(&ent.name), Some(h));
            if let Some(parent) = ent.parent {
                let p = self.get(parent).expect("parent in arena");
                let ext = p.serv().expect("parent is a server");
                if ent.is_server() {
                    assert!(ext.children.contains(&h));
                } else {
                    assert!(ext.users.contains(&h));
                }
            } else {
                assert_eq!(h, self.me);
            }
        }
        for room in self.rooms.values() {
            assert!(!room.members.is_empty());
            for (&raw, &flags) in room.members.iter() {
                assert!(self.get(EntId(raw)).is_some());
                assert_eq!(flags & !(ROLE_CHANOP | ROLE_VOICE), 0);
            }
        }
    }
}
