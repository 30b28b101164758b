use crate::error::{Error, Result};

/// Environment variable that pins the node id.
pub const NODE_ID_ENV: &str = "CLUSTERCOORD_NODE_ID";

/// Derive a node identifier.
///
/// Prefers the `CLUSTERCOORD_NODE_ID` environment variable.  Falls back to
/// `<hostname>-<random-8-chars>` so that every process gets a unique id even
/// on the same host.  `:` is the field delimiter of several wire formats, so
/// it is replaced in hostnames and rejected in explicit ids.
pub fn node_id() -> Result<String> {
    node_id_from(std::env::var(NODE_ID_ENV).ok())
}

fn node_id_from(explicit: Option<String>) -> Result<String> {
    match explicit {
        Some(id) => {
            check_node_id(&id)?;
            Ok(id)
        }
        None => {
            let hostname = gethostname::gethostname()
                .to_string_lossy()
                .replace(':', "-");
            let suffix = &uuid::Uuid::new_v4().to_string()[..8];
            Ok(format!("{hostname}-{suffix}"))
        }
    }
}

/// Node ids must be non-empty and free of `:`.
pub fn check_node_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(':') {
        return Err(Error::contract(format!(
            "node id {id:?} must be non-empty and must not contain ':'"
        )));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch, as stored in lock and liveness values.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_delimiter_free() {
        let a = node_id_from(None).unwrap();
        let b = node_id_from(None).unwrap();
        assert_ne!(a, b);
        assert!(!a.contains(':'));
    }

    #[test]
    fn explicit_ids_are_checked() {
        assert_eq!(node_id_from(Some("node-a".into())).unwrap(), "node-a");
        assert!(matches!(
            node_id_from(Some("host:1".into())),
            Err(Error::Contract(_))
        ));
        assert!(node_id_from(Some(String::new())).is_err());
    }
}
