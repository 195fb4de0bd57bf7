use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Default)]
struct GraphInner {
    documents: BTreeSet<String>,
    forward: BTreeMap<String, BTreeSet<String>>,
    reverse: BTreeMap<String, BTreeSet<String>>,
}

/// In-memory forward/reverse edge index over relative markdown links.
/// Readers run concurrently; writers take exclusive access.
#[derive(Default)]
pub struct LinkGraph {
    inner: RwLock<GraphInner>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&self, path: &str) {
        let mut inner = self.inner.write();
        inner.documents.insert(path.to_string());
    }

    /// Removes the node and every incident edge, in both directions.
    pub fn remove_document(&self, path: &str) {
        let mut inner = self.inner.write();
        inner.documents.remove(path);

        if let Some(targets) = inner.forward.remove(path) {
            for target in targets {
                if let Some(sources) = inner.reverse.get_mut(&target) {
                    sources.remove(path);
                    if sources.is_empty() {
                        inner.reverse.remove(&target);
                    }
                }
            }
        }
        if let Some(sources) = inner.reverse.remove(path) {
            for source in sources {
                if let Some(targets) = inner.forward.get_mut(&source) {
                    targets.remove(path);
                    if targets.is_empty() {
                        inner.forward.remove(&source);
                    }
                }
            }
        }
        debug!(path, "Removed document from link graph");
    }

    pub fn add_link(&self, source: &str, target: &str) {
        if source == target {
            return;
        }
        let mut inner = self.inner.write();
        inner
            .forward
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string());
        inner
            .reverse
            .entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }

    /// Replace all outgoing links of a document in one exclusive section.
    pub fn set_links(&self, source: &str, targets: &[String]) {
        self.remove_outgoing(source);
        for target in targets {
            self.add_link(source, target);
        }
    }

    fn remove_outgoing(&self, source: &str) {
        let mut inner = self.inner.write();
        if let Some(targets) = inner.forward.remove(source) {
            for target in targets {
                if let Some(sources) = inner.reverse.get_mut(&target) {
                    sources.remove(source);
                    if sources.is_empty() {
                        inner.reverse.remove(&target);
                    }
                }
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.read().documents.contains(path)
    }

    pub fn outgoing(&self, path: &str) -> Vec<String> {
        self.inner
            .read()
            .forward
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn backlinks(&self, path: &str) -> Vec<String> {
        self.inner
            .read()
            .reverse
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Edges whose target is not a known document.
    pub fn broken_links(&self) -> Vec<(String, String)> {
        let inner = self.inner.read();
        let mut broken = Vec::new();
        for (source, targets) in &inner.forward {
            for target in targets {
                if !inner.documents.contains(target) {
                    broken.push((source.clone(), target.clone()));
                }
            }
        }
        broken
    }

    pub fn document_count(&self) -> usize {
        self.inner.read().documents.len()
    }

    pub fn link_count(&self) -> usize {
        self.inner
            .read()
            .forward
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    /// Normalise a relative markdown link against its source document.
    /// Returns `None` when the link escapes the repository root.
    pub fn resolve(source_path: &str, link_url: &str) -> Option<String> {
        let target = link_url
            .split(['#', '?'])
            .next()
            .unwrap_or_default()
            .trim();
        if target.is_empty() {
            return None;
        }

        let mut segments: Vec<&str> = match source_path.rsplit_once('/') {
            Some((dir, _)) => dir.split('/').collect(),
            None => Vec::new(),
        };

        let normalized_target = target.replace('\\', "/");
        for segment in normalized_target.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return None;
                    }
                }
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return None;
        }
        Some(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_reverse_stay_symmetric() {
        let graph = LinkGraph::new();
        graph.add_document("a.md");
        graph.add_document("b.md");
        graph.add_link("a.md", "b.md");
        graph.add_link("b.md", "a.md");

        assert_eq!(graph.outgoing("a.md"), vec!["b.md"]);
        assert_eq!(graph.backlinks("a.md"), vec!["b.md"]);
        assert_eq!(graph.outgoing("b.md"), vec!["a.md"]);
        assert_eq!(graph.backlinks("b.md"), vec!["a.md"]);
    }

    #[test]
    fn circular_references_are_legal() {
        let graph = LinkGraph::new();
        graph.add_document("a.md");
        graph.add_document("b.md");
        graph.add_link("a.md", "b.md");
        graph.add_link("b.md", "a.md");
        assert!(graph.broken_links().is_empty());
        assert_eq!(graph.link_count(), 2);
    }

    #[test]
    fn remove_document_drops_incident_edges() {
        let graph = LinkGraph::new();
        for doc in ["a.md", "b.md", "c.md"] {
            graph.add_document(doc);
        }
        graph.add_link("a.md", "b.md");
        graph.add_link("c.md", "b.md");
        graph.add_link("b.md", "a.md");

        graph.remove_document("b.md");

        assert!(!graph.contains("b.md"));
        assert!(graph.outgoing("a.md").is_empty());
        assert!(graph.outgoing("c.md").is_empty());
        assert!(graph.backlinks("a.md").is_empty());
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn broken_links_are_edges_to_unknown_targets() {
        let graph = LinkGraph::new();
        graph.add_document("a.md");
        graph.add_link("a.md", "missing.md");
        assert_eq!(
            graph.broken_links(),
            vec![("a.md".to_string(), "missing.md".to_string())]
        );

        graph.add_document("missing.md");
        assert!(graph.broken_links().is_empty());
    }

    #[test]
    fn set_links_replaces_outgoing_edges() {
        let graph = LinkGraph::new();
        graph.add_document("a.md");
        graph.add_link("a.md", "old.md");
        graph.set_links("a.md", &["new.md".to_string()]);
        assert_eq!(graph.outgoing("a.md"), vec!["new.md"]);
        assert!(graph.backlinks("old.md").is_empty());
    }

    #[test]
    fn resolve_normalises_relative_links() {
        assert_eq!(
            LinkGraph::resolve("docs/guides/a.md", "setup.md"),
            Some("docs/guides/setup.md".to_string())
        );
        assert_eq!(
            LinkGraph::resolve("docs/guides/a.md", "../ref/b.md#section"),
            Some("docs/ref/b.md".to_string())
        );
        assert_eq!(
            LinkGraph::resolve("a.md", "./b.md"),
            Some("b.md".to_string())
        );
        assert_eq!(LinkGraph::resolve("a.md", "../escape.md"), None);
        assert_eq!(LinkGraph::resolve("docs/a.md", "#anchor"), None);
    }

    #[test]
    fn self_links_are_ignored() {
        let graph = LinkGraph::new();
        graph.add_document("a.md");
        graph.add_link("a.md", "a.md");
        assert_eq!(graph.link_count(), 0);
    }
}
