//! Images and node bindings
//!
//! The image backend lives outside the server; it only has to answer
//! whether a tag exists. Binding an image to nodes is done here: the node
//! state and the recorded binding change together, and the owner follows
//! the image (the default image frees the node).

use crate::registry::Registry;
use kestrel_common::{ImageBinding, Mac, DEFAULT_IMAGE};
use std::path::PathBuf;
use tracing::{info, warn};

/// Image backend capability. Blocking.
pub trait ImageStore: Send + Sync {
    fn exists(&self, tag: &str) -> bool;

    /// Concrete image the default tag currently designates
    fn resolve_default(&self) -> String;
}

/// One directory per image tag under `root`.
///
/// The default image may be a symlink to another tag's directory.
#[derive(Debug, Clone)]
pub struct DirImageStore {
    root: PathBuf,
}

impl DirImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Tags are single path components
fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag != "."
        && tag != ".."
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

impl ImageStore for DirImageStore {
    fn exists(&self, tag: &str) -> bool {
        is_valid_tag(tag) && self.root.join(tag).is_dir()
    }

    fn resolve_default(&self) -> String {
        let link = self.root.join(DEFAULT_IMAGE);
        std::fs::read_link(&link)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }
}

/// Per-node result of a binding batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BindingReport {
    pub bound: Vec<Mac>,
    /// Node name and reason
    pub failed: Vec<(String, String)>,
}

/// Bind `tag` to each node. Failures are per node; the others proceed.
pub fn bind_nodes(registry: &mut Registry, nodes: &[Mac], tag: &str, requester: &str) -> BindingReport {
    let mut report = BindingReport::default();
    for &mac in nodes {
        let name = registry.name_of(mac);
        match registry.set_binding(ImageBinding::new(mac, tag, requester)) {
            Ok(()) => {
                info!(node = %name, image = tag, requester, "image bound");
                report.bound.push(mac);
            }
            Err(e) => {
                warn!(node = %name, image = tag, error = %e, "image binding failed");
                report.failed.push((name, e.to_string()));
            }
        }
    }
    report
}

/// Sentence confirming a deployment, as shown to the requester
pub fn deployment_sentence(names: &[String], tag: &str, resolved_default: &str) -> String {
    let subject = crate::registry::format_names(names);
    if tag == DEFAULT_IMAGE {
        let detail = if resolved_default != DEFAULT_IMAGE {
            format!(" ({})", resolved_default)
        } else {
            String::new()
        };
        if names.len() == 1 {
            format!("{} will now boot its default image{} (other users will see it is 'free').", subject, detail)
        } else {
            format!("{} will now boot their default image{} (other users will see they are 'free').", subject, detail)
        }
    } else {
        format!("{} will now boot {}.", subject, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Sighting;
    use kestrel_common::DeviceKind;

    #[test]
    fn test_dir_image_store() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("debian-12")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let store = DirImageStore::new(tmp.path());
        assert!(store.exists("debian-12"));
        assert!(!store.exists("notes.txt"));
        assert!(!store.exists("missing"));
        assert!(!store.exists("../etc"));
        assert!(!store.exists(""));
        assert_eq!(store.resolve_default(), DEFAULT_IMAGE);
    }

    #[cfg(unix)]
    #[test]
    fn test_default_symlink_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("raspbian-lite")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("raspbian-lite"), tmp.path().join(DEFAULT_IMAGE)).unwrap();

        let store = DirImageStore::new(tmp.path());
        assert!(store.exists(DEFAULT_IMAGE));
        assert_eq!(store.resolve_default(), "raspbian-lite");
    }

    #[test]
    fn test_bind_nodes_sets_and_clears_owner() {
        let mut reg = Registry::new();
        let n1 = Mac::new([0, 0, 0, 0, 0, 1]);
        let sw = Mac::new([0, 0, 0, 0, 0, 9]);
        reg.upsert_device(Sighting::new(n1).with_kind(DeviceKind::Node).with_name("rpi1"));
        reg.upsert_device(Sighting::new(sw).with_kind(DeviceKind::Switch).with_name("sw1"));

        let report = bind_nodes(&mut reg, &[n1, sw], "custom", "alice");
        assert_eq!(report.bound, vec![n1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "sw1");

        let node = reg.device(n1).unwrap().node().unwrap();
        assert_eq!(node.image, "custom");
        assert!(node.is_owned_by("alice"));

        bind_nodes(&mut reg, &[n1], DEFAULT_IMAGE, "alice");
        assert!(reg.device(n1).unwrap().node().unwrap().is_free());
        assert_eq!(reg.binding(n1).unwrap().owner, None);
    }

    #[test]
    fn test_deployment_sentence() {
        let one = vec!["rpi1".to_string()];
        let two = vec!["rpi1".to_string(), "rpi2".to_string()];
        assert_eq!(deployment_sentence(&one, "custom", "default"), "rpi1 will now boot custom.");
        assert!(deployment_sentence(&two, DEFAULT_IMAGE, "raspbian").starts_with(
            "rpi1 and rpi2 will now boot their default image (raspbian)"
        ));
    }
}
