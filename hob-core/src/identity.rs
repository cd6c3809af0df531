//! Identifier generation: object, frame and node ids and server version numbers.

use uuid::Uuid;

/// Length of the random suffix appended to an object name.
pub const ID_SUFFIX_LEN: usize = 12;

/// Random alphanumeric suffix taken from a v4 UUID.
pub fn random_suffix() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..ID_SUFFIX_LEN].to_string()
}

/// Object id: the human-readable name followed by a random suffix.
pub fn object_id(name: &str) -> String {
    format!("{name}{}", random_suffix())
}

/// Frame id: owning object id followed by the frame name.
pub fn frame_id(object_id: &str, frame_name: &str) -> String {
    format!("{object_id}{frame_name}")
}

/// Node id: owning frame id followed by the node name.
pub fn node_id(frame_id: &str, node_name: &str) -> String {
    format!("{frame_id}{node_name}")
}

/// Fresh id for a link.
pub fn link_id() -> String {
    format!("link{}", random_suffix())
}

/// Numeric form of a dotted version string as carried in heartbeats: "3.1.0" -> 310.
/// Non-numeric components are skipped.
pub fn version_number(version: &str) -> u32 {
    version
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_has_name_prefix_and_suffix() {
        let id = object_id("lamp");
        assert!(id.starts_with("lamp"));
        assert_eq!(id.len(), "lamp".len() + ID_SUFFIX_LEN);
        assert!(id["lamp".len()..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(object_id("lamp"), object_id("lamp"));
        assert_ne!(link_id(), link_id());
    }

    #[test]
    fn nested_ids() {
        let f = frame_id("lampAbCdEfGhIjKl", "switch");
        assert_eq!(f, "lampAbCdEfGhIjKlswitch");
        assert_eq!(node_id(&f, "value"), "lampAbCdEfGhIjKlswitchvalue");
    }

    #[test]
    fn version_numbers() {
        assert_eq!(version_number("3.1.0"), 310);
        assert_eq!(version_number("2.0"), 20);
        assert_eq!(version_number(""), 0);
    }
}
