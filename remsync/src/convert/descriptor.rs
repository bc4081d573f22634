use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Item kind on the device: a convertible notebook or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Document,
    Collection,
}

/// Parsed `<uuid>.metadata` descriptor. One per backed-up item; parsed
/// fresh on every conversion run, never cached across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: ItemKind,
    /// Empty for root-level items.
    pub parent: String,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "visibleName", default = "untitled")]
    visible_name: String,
    #[serde(default)]
    parent: String,
}

fn untitled() -> String {
    "Untitled".to_string()
}

/// Parses one descriptor file. `Ok(None)` for items that are neither
/// documents nor collections (deleted stubs and such); `Err` only for
/// unreadable or malformed JSON, which callers skip with a warning.
pub fn parse_descriptor(path: &Path) -> Result<Option<NotebookDescriptor>, serde_json::Error> {
    let bytes = std::fs::read(path).map_err(serde_json::Error::io)?;
    let raw: RawDescriptor = serde_json::from_slice(&bytes)?;
    let kind = match raw.kind.as_str() {
        "DocumentType" => ItemKind::Document,
        "CollectionType" => ItemKind::Collection,
        _ => return Ok(None),
    };
    let id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Some(NotebookDescriptor {
        id,
        display_name: raw.visible_name,
        kind,
        parent: raw.parent,
    }))
}

/// Loads every descriptor under `files_dir`. Malformed descriptors are
/// skipped with a warning; the run continues.
pub fn load_descriptors(files_dir: &Path) -> std::io::Result<Vec<NotebookDescriptor>> {
    let mut descriptors = Vec::new();
    for entry in std::fs::read_dir(files_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("metadata") {
            continue;
        }
        match parse_descriptor(&path) {
            Ok(Some(descriptor)) => descriptors.push(descriptor),
            Ok(None) => {}
            Err(err) => {
                eprintln!("[remsync] warning: skipping {}: {err}", path.display());
            }
        }
    }
    Ok(descriptors)
}

/// Declared page ordering and per-page template names from a notebook's
/// `<uuid>.content` file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageOrder {
    /// Page ids in declared document order.
    pub pages: Vec<String>,
    /// Page id → template name, where declared.
    pub templates: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    #[serde(default)]
    pages: Vec<String>,
    #[serde(rename = "cPages", default)]
    c_pages: Option<RawCPages>,
}

#[derive(Debug, Deserialize)]
struct RawCPages {
    #[serde(default)]
    pages: Vec<RawCPage>,
}

#[derive(Debug, Deserialize)]
struct RawCPage {
    id: Option<String>,
    #[serde(default)]
    template: Option<RawTemplate>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    value: Option<String>,
}

/// Reads the page-order descriptor next to a notebook's metadata file.
/// Two on-disk layouts exist: a flat `pages` id list (older firmware) and
/// the `cPages.pages` records carrying per-page template names. `None`
/// when the file is absent or unreadable — callers fall back to discovery
/// order.
pub fn read_page_order(content_path: &Path) -> Option<PageOrder> {
    let bytes = std::fs::read(content_path).ok()?;
    let raw: RawContent = serde_json::from_slice(&bytes).ok()?;

    let mut order = PageOrder::default();
    if let Some(c_pages) = &raw.c_pages {
        for page in &c_pages.pages {
            let Some(id) = &page.id else { continue };
            order.pages.push(id.clone());
            if let Some(value) = page.template.as_ref().and_then(|t| t.value.clone()) {
                order.templates.insert(id.clone(), value);
            }
        }
    }
    if order.pages.is_empty() {
        order.pages = raw.pages;
    }
    if order.pages.is_empty() && order.templates.is_empty() {
        None
    } else {
        Some(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_document_and_collection_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("abcdefab-1234-5678-9abc-abcdefabcdef.metadata");
        std::fs::write(
            &doc,
            r#"{"type":"DocumentType","visibleName":"Meeting Notes","parent":"folder-1"}"#,
        )
        .unwrap();
        let parsed = parse_descriptor(&doc).unwrap().unwrap();
        assert_eq!(parsed.kind, ItemKind::Document);
        assert_eq!(parsed.display_name, "Meeting Notes");
        assert_eq!(parsed.parent, "folder-1");
        assert_eq!(parsed.id, "abcdefab-1234-5678-9abc-abcdefabcdef");

        let folder = dir.path().join("f.metadata");
        std::fs::write(&folder, r#"{"type":"CollectionType","visibleName":"Work"}"#).unwrap();
        let parsed = parse_descriptor(&folder).unwrap().unwrap();
        assert_eq!(parsed.kind, ItemKind::Collection);
        assert_eq!(parsed.parent, "");
    }

    #[test]
    fn unknown_types_are_ignored_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.metadata");
        std::fs::write(&path, r#"{"type":"TrashType","visibleName":"gone"}"#).unwrap();
        assert!(parse_descriptor(&path).unwrap().is_none());
    }

    #[test]
    fn load_descriptors_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.metadata"),
            r#"{"type":"DocumentType","visibleName":"A"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.metadata"), b"{").unwrap();
        std::fs::write(dir.path().join("other.content"), b"{}").unwrap();
        let descriptors = load_descriptors(dir.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].display_name, "A");
    }

    #[test]
    fn reads_flat_pages_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.content");
        std::fs::write(&path, r#"{"pages":["p3","p1","p2"]}"#).unwrap();
        let order = read_page_order(&path).unwrap();
        assert_eq!(order.pages, vec!["p3", "p1", "p2"]);
        assert!(order.templates.is_empty());
    }

    #[test]
    fn reads_cpages_with_template_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.content");
        std::fs::write(
            &path,
            r#"{"cPages":{"pages":[
                {"id":"p1","template":{"value":"P Lines small"}},
                {"id":"p2","template":{"value":"Blank"}},
                {"id":"p3"}
            ]}}"#,
        )
        .unwrap();
        let order = read_page_order(&path).unwrap();
        assert_eq!(order.pages, vec!["p1", "p2", "p3"]);
        assert_eq!(order.templates.get("p1").unwrap(), "P Lines small");
        assert_eq!(order.templates.get("p2").unwrap(), "Blank");
        assert!(!order.templates.contains_key("p3"));
    }

    #[test]
    fn absent_or_empty_content_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_page_order(&dir.path().join("missing.content")).is_none());
        let empty = dir.path().join("empty.content");
        std::fs::write(&empty, b"{}").unwrap();
        assert!(read_page_order(&empty).is_none());
    }
}
