//! Wire grammar of the line protocol: tokenizing, case folding,
//! wildcard mask matching and token classification.
//!
//! A line is `[':' source SP] command SP params [SP ':' trailing]`,
//! with up to `MAX_PARA` space separated parameters plus an optional
//! colon prefixed trailing parameter that may contain spaces.

use smallvec::SmallVec;

/// Maximum number of parameters per line, the trailing one included.
pub const MAX_PARA: usize = 15;

/// Maximum length of a server or host name.
pub const HOST_LEN: usize = 63;

/// Parameter vector: `parv[0]` is the source name, the rest are the
/// command parameters.
pub type Params<'a> = SmallVec<[&'a str; MAX_PARA + 2]>;

/// A tokenized line, before source resolution.
pub struct TokenizedLine<'a> {
    pub source: Option<&'a str>,
    pub command: &'a str,
    pub args: SmallVec<[&'a str; MAX_PARA]>,
}

/// Splits a line into source, command and parameters.
///
/// Returns `None` for lines that hold no command at all.
pub fn tokenize(line: &str) -> Option<TokenizedLine<'_>> {
    let mut rest = line.trim_start_matches(' ');

    let source = if let Some(stripped) = rest.strip_prefix(':') {
        let (src, tail) = match stripped.split_once(' ') {
            Some((s, t)) => (s, t.trim_start_matches(' ')),
            None => (stripped, ""),
        };
        rest = tail;
        if src.is_empty() {
            None
        } else {
            Some(src)
        }
    } else {
        None
    };

    if rest.is_empty() {
        return None;
    }

    let (command, mut tail) = match rest.split_once(' ') {
        Some((c, t)) => (c, t),
        None => (rest, ""),
    };

    let mut args: SmallVec<[&str; MAX_PARA]> = SmallVec::new();
    loop {
        tail = tail.trim_start_matches(' ');
        if tail.is_empty() {
            break;
        }
        if let Some(trailing) = tail.strip_prefix(':') {
            args.push(trailing);
            break;
        }
        if args.len() == MAX_PARA - 1 {
            // everything left is the last parameter
            args.push(tail.strip_prefix(':').unwrap_or(tail));
            break;
        }
        match tail.split_once(' ') {
            Some((arg, t)) => {
                args.push(arg);
                tail = t;
            }
            None => {
                args.push(tail);
                break;
            }
        }
    }

    Some(TokenizedLine {
        source,
        command,
        args,
    })
}

/// rfc1459 lowercase map: `[]\~` fold onto `{}|^`.
pub fn to_lower(b: u8) -> u8 {
    match b {
        b'A'..=b'Z' => b + 32,
        b'[' => b'{',
        b']' => b'}',
        b'\\' => b'|',
        b'~' => b'^',
        _ => b,
    }
}

/// Case folds a name for index keys.
pub fn fold(s: &str) -> String {
    s.bytes().map(|b| to_lower(b) as char).collect()
}

/// Case insensitive name comparison under the rfc1459 casemapping.
pub fn name_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| to_lower(x) == to_lower(y))
}

/// Matches `name` against a wildcard `mask` (`*` and `?`), case
/// insensitively.
pub fn mask_match(mask: &str, name: &str) -> bool {
    let m = mask.as_bytes();
    let n = name.as_bytes();
    let (mut mi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if mi < m.len() && (m[mi] == b'?' || to_lower(m[mi]) == to_lower(n[ni])) {
            mi += 1;
            ni += 1;
        } else if mi < m.len() && m[mi] == b'*' {
            star = Some((mi, ni));
            mi += 1;
        } else if let Some((smi, sni)) = star {
            mi = smi + 1;
            ni = sni + 1;
            star = Some((smi, sni + 1));
        } else {
            return false;
        }
    }
    while mi < m.len() && m[mi] == b'*' {
        mi += 1;
    }
    mi == m.len()
}

/// Reports whether a command token is a three digit numeric.
pub fn is_numeric(cmd: &str) -> bool {
    cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit())
}

fn is_serv_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'-'
}

/// Validates a server name: permitted characters only, at least one
/// dot, within the length limit.
pub fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= HOST_LEN
        && name.bytes().all(is_serv_char)
        && name.contains('.')
}

fn is_id_char(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit()
}

/// Validates a short server id: three characters, the first a digit.
pub fn valid_sid(id: &str) -> bool {
    let b = id.as_bytes();
    b.len() == 3 && b[0].is_ascii_digit() && b[1..].iter().all(|&c| is_id_char(c))
}

/// Reports whether an unknown source token names a server rather than
/// a user: a three character digit led id, or a dotted name. Servers
/// are corrected with SQUIT, users with KILL.
pub fn token_is_server_like(token: &str) -> bool {
    let b = token.as_bytes();
    (b.len() == 3 && b[0].is_ascii_digit()) || token.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_source_and_trailing() {
        let t = tokenize(":42X SID irc.c.net 2 42C :C Net").unwrap();
        assert_eq!(t.source, Some("42X"));
        assert_eq!(t.command, "SID");
        assert_eq!(&t.args[..], &["irc.c.net", "2", "42C", "C Net"]);
    }

    #[test]
    fn test_tokenize_no_source() {
        let t = tokenize("PING :irc.a.net").unwrap();
        assert_eq!(t.source, None);
        assert_eq!(t.command, "PING");
        assert_eq!(&t.args[..], &["irc.a.net"]);
    }

    #[test]
    fn test_tokenize_empty_and_spaces() {
        assert!(tokenize("").is_none());
        assert!(tokenize("   ").is_none());
        assert!(tokenize(":src ").is_none());
    }

    #[test]
    fn test_tokenize_caps_params() {
        // more than MAX_PARA tokens collapse into the last parameter
        let many = (0..20).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let line = format!("CMD {}", many);
        let t = tokenize(&line).unwrap();
        assert_eq!(t.args.len(), MAX_PARA);
        assert!(t.args[MAX_PARA - 1].contains(' '));
    }

    #[test]
    fn test_casemapping() {
        assert!(name_eq("alice[a]", "ALICE{A}"));
        assert!(name_eq("w\\x~", "W|X^"));
        assert!(!name_eq("alice", "alicia"));
        assert_eq!(fold("IRC.B.Net"), "irc.b.net");
    }

    #[test]
    fn test_mask_match() {
        assert!(mask_match("*", "irc.school.edu"));
        assert!(mask_match("*.edu", "irc.school.edu"));
        assert!(!mask_match("*.edu", "irc.b.net"));
        assert!(mask_match("irc.?.net", "irc.b.net"));
        assert!(mask_match("IRC.B.NET", "irc.b.net"));
        assert!(!mask_match("irc.*.org", "irc.b.net"));
    }

    #[test]
    fn test_server_name_validation() {
        assert!(valid_server_name("irc.b.net"));
        assert!(!valid_server_name("ircbnet"));
        assert!(!valid_server_name("irc b.net"));
        assert!(!valid_server_name(&"a.".repeat(64)));
    }

    #[test]
    fn test_sid_validation() {
        assert!(valid_sid("42X"));
        assert!(valid_sid("0AB"));
        assert!(!valid_sid("X42"));
        assert!(!valid_sid("42"));
        assert!(!valid_sid("42XX"));
    }

    #[test]
    fn test_unknown_token_classification() {
        assert!(token_is_server_like("42X"));
        assert!(token_is_server_like("irc.b.net"));
        assert!(!token_is_server_like("alice"));
        // a nine character uid is killed, not squit
        assert!(!token_is_server_like("42XAAAAAB"));
    }

    #[test]
    fn test_numeric_detection() {
        assert!(is_numeric("401"));
        assert!(!is_numeric("EOB"));
        assert!(!is_numeric("40"));
    }
}
