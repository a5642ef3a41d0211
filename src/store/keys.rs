//! Key layout for the store.
//!
//! `config/{name}/{tag1}#{tag2}#...#{tagN}` holds config payloads and
//! `slave/{id}` holds the advertised address of a registered slave.

use uuid::Uuid;

/// Prefix under which config entries live
pub const CONFIG_PREFIX: &str = "config/";

/// Prefix under which slave registrations live
pub const SLAVE_PREFIX: &str = "slave/";

/// Build the store key for a config entry.
///
/// Tags are joined in caller-supplied order unless `canonical` is set, in
/// which case they are sorted first so the same tag set always addresses
/// the same entry regardless of ordering.
pub fn config_key(name: &str, tags: &[String], canonical: bool) -> String {
    let joined = if canonical {
        let mut sorted = tags.to_vec();
        sorted.sort();
        sorted.join("#")
    } else {
        tags.join("#")
    };
    format!("{}{}/{}", CONFIG_PREFIX, name, joined)
}

/// The pub/sub topic for a config entry is its store key.
pub fn topic(name: &str, tags: &[String], canonical: bool) -> String {
    config_key(name, tags, canonical)
}

/// Build the store key for a slave registration
pub fn slave_key(id: &Uuid) -> String {
    format!("{}{}", SLAVE_PREFIX, id)
}

/// Recover `(name, tags)` from a config key.
///
/// The name may itself contain `/`; the tag segment is everything after
/// the last separator. Returns `None` for keys outside the config prefix.
pub fn parse_config_key(key: &str) -> Option<(String, Vec<String>)> {
    let rest = key.strip_prefix(CONFIG_PREFIX)?;
    let (name, tag_part) = rest.rsplit_once('/')?;
    let tags = if tag_part.is_empty() {
        Vec::new()
    } else {
        tag_part.split('#').map(str::to_string).collect()
    };
    Some((name.to_string(), tags))
}

/// Recover the slave id from a `slave/{id}` key
pub fn parse_slave_key(key: &str) -> Option<Uuid> {
    let rest = key.strip_prefix(SLAVE_PREFIX)?;
    Uuid::parse_str(rest).ok()
}
