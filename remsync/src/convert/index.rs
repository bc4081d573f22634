use std::collections::HashMap;

use super::descriptor::{ItemKind, NotebookDescriptor};

/// Reserved parent marker for items in the device trash.
const TRASH_PARENT: &str = "trash";

/// Materialized view over the descriptor forest: the documents to convert
/// and, for each, its folder path as Collection display names from root to
/// leaf.
#[derive(Debug, Default)]
pub struct NotebookIndex {
    pub documents: Vec<NotebookDescriptor>,
    folder_paths: HashMap<String, Vec<String>>,
}

impl NotebookIndex {
    /// Builds the index. Folder paths are resolved by walking each
    /// document's parent pointers upward; the result depends only on the
    /// descriptor set, not on input order.
    pub fn build(descriptors: &[NotebookDescriptor]) -> Self {
        let by_id: HashMap<&str, &NotebookDescriptor> =
            descriptors.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut index = NotebookIndex::default();
        for descriptor in descriptors {
            if descriptor.kind != ItemKind::Document {
                continue;
            }
            let path = resolve_folder_path(descriptor, &by_id, descriptors.len());
            index.folder_paths.insert(descriptor.id.clone(), path);
            index.documents.push(descriptor.clone());
        }
        index.documents.sort_by(|a, b| a.id.cmp(&b.id));
        index
    }

    /// Folder path for a document id, root-first. Empty for root-level
    /// documents or unknown ids.
    pub fn folder_path(&self, id: &str) -> &[String] {
        self.folder_paths.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Walks the parent chain upward, prepending each Collection's sanitized
/// display name. Stops on an empty parent, the trash marker, or an id
/// absent from the index — a broken chain truncates the path without
/// error. Traversal is capped at the descriptor count so a cycle in the
/// forest terminates as a broken chain instead of looping.
fn resolve_folder_path(
    document: &NotebookDescriptor,
    by_id: &HashMap<&str, &NotebookDescriptor>,
    cap: usize,
) -> Vec<String> {
    let mut path = Vec::new();
    let mut current = document.parent.as_str();
    let mut steps = 0;

    while !current.is_empty() && current != TRASH_PARENT {
        if steps >= cap {
            break;
        }
        steps += 1;
        let Some(ancestor) = by_id.get(current) else {
            break;
        };
        if ancestor.kind == ItemKind::Collection {
            let name = sanitize_name(&ancestor.display_name);
            if !name.is_empty() {
                path.insert(0, name);
            }
        }
        current = ancestor.parent.as_str();
    }
    path
}

/// Keeps alphanumerics, spaces, hyphens and underscores; trims the result.
/// Display names are user input and become filesystem components.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, name: &str, parent: &str) -> NotebookDescriptor {
        NotebookDescriptor {
            id: id.to_string(),
            display_name: name.to_string(),
            kind: ItemKind::Collection,
            parent: parent.to_string(),
        }
    }

    fn document(id: &str, name: &str, parent: &str) -> NotebookDescriptor {
        NotebookDescriptor {
            id: id.to_string(),
            display_name: name.to_string(),
            kind: ItemKind::Document,
            parent: parent.to_string(),
        }
    }

    #[test]
    fn chain_resolves_root_first() {
        // Doc -> Folder A -> Folder B -> root reads B/A on disk.
        let descriptors = vec![
            document("doc", "Notes", "a"),
            folder("a", "Folder A", "b"),
            folder("b", "Folder B", ""),
        ];
        let index = NotebookIndex::build(&descriptors);
        assert_eq!(index.folder_path("doc"), ["Folder B", "Folder A"]);
    }

    #[test]
    fn resolution_is_input_order_independent() {
        let mut descriptors = vec![
            document("doc", "Notes", "a"),
            folder("a", "Folder A", "b"),
            folder("b", "Folder B", ""),
        ];
        let forward = NotebookIndex::build(&descriptors);
        descriptors.reverse();
        let reversed = NotebookIndex::build(&descriptors);
        assert_eq!(forward.folder_path("doc"), reversed.folder_path("doc"));
    }

    #[test]
    fn broken_chain_truncates_without_error() {
        let descriptors = vec![
            document("doc", "Notes", "a"),
            folder("a", "Folder A", "missing-parent"),
        ];
        let index = NotebookIndex::build(&descriptors);
        assert_eq!(index.folder_path("doc"), ["Folder A"]);
    }

    #[test]
    fn trash_marker_stops_the_walk() {
        let descriptors = vec![document("doc", "Notes", "trash")];
        let index = NotebookIndex::build(&descriptors);
        assert!(index.folder_path("doc").is_empty());
    }

    #[test]
    fn cycles_terminate_as_broken_chains() {
        let descriptors = vec![
            document("doc", "Notes", "a"),
            folder("a", "A", "b"),
            folder("b", "B", "a"),
        ];
        let index = NotebookIndex::build(&descriptors);
        // The walk visits a and b some bounded number of times, then stops.
        assert!(index.folder_path("doc").len() <= descriptors.len());
    }

    #[test]
    fn collections_are_not_listed_as_documents() {
        let descriptors = vec![folder("a", "A", ""), document("doc", "N", "")];
        let index = NotebookIndex::build(&descriptors);
        assert_eq!(index.documents.len(), 1);
        assert_eq!(index.documents[0].id, "doc");
    }

    #[test]
    fn sanitize_strips_filesystem_hostile_characters() {
        assert_eq!(sanitize_name("Q3 / Planning: v2!"), "Q3  Planning v2");
        assert_eq!(sanitize_name("  plain-name_1  "), "plain-name_1");
        assert_eq!(sanitize_name("///"), "");
    }
}
