use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::assemble::{DocumentAssembler, MergeError};
use super::classify::{FormatGeneration, classify_page};
use super::descriptor::{NotebookDescriptor, PageOrder, read_page_order};
use super::index::sanitize_name;
use super::overlay::{OverlayMerger, overlay_template};
use super::renderer::PageRenderer;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One page artifact discovered in a notebook directory.
#[derive(Debug, Clone)]
pub struct PageArtifact {
    pub path: PathBuf,
    pub page_id: String,
    pub generation: FormatGeneration,
}

/// What converting one notebook produced. Reported, never persisted.
#[derive(Debug, Default)]
pub struct ConversionOutcome {
    pub name: String,
    pub folder: Vec<String>,
    pub converted: BTreeMap<FormatGeneration, usize>,
    pub unsupported: BTreeMap<FormatGeneration, usize>,
    pub outputs: Vec<PathBuf>,
}

impl ConversionOutcome {
    pub fn pages_converted(&self) -> usize {
        self.converted.values().sum()
    }
}

/// Converts notebooks one at a time: whole-document attempt where the
/// pages allow it, per-page fallback otherwise, placeholder sidecar when
/// nothing was convertible. Notebooks are independent; the run layer may
/// drive several dispatch calls concurrently.
pub struct Dispatcher {
    renderer: Arc<dyn PageRenderer>,
    overlay: OverlayMerger,
    assembler: DocumentAssembler,
    files_dir: PathBuf,
    output_root: PathBuf,
    verbose: bool,
}

impl Dispatcher {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        overlay: OverlayMerger,
        assembler: DocumentAssembler,
        files_dir: PathBuf,
        output_root: PathBuf,
        verbose: bool,
    ) -> Self {
        Self {
            renderer,
            overlay,
            assembler,
            files_dir,
            output_root,
            verbose,
        }
    }

    /// Discovers and classifies the page artifacts of a notebook.
    /// Unknown-format files are silently excluded here, by policy.
    /// Discovery order is lexicographic by file name: a best-effort
    /// fallback only, not the device's page order.
    fn collect_pages(&self, notebook_id: &str) -> io::Result<Vec<PageArtifact>> {
        let dir = self.files_dir.join(notebook_id);
        let mut pages = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(pages),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some("rm") | Some("pdf")) {
                continue;
            }
            let generation = classify_page(&path);
            if generation == FormatGeneration::Unknown {
                continue;
            }
            let page_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            pages.push(PageArtifact {
                path,
                page_id,
                generation,
            });
        }
        pages.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(pages)
    }

    /// Applies the declared page order: declared ids first, in order, then
    /// any undeclared drawn pages in discovery order, then pre-rendered
    /// PDFs. Without a declaration everything stays in discovery order.
    fn order_pages(pages: Vec<PageArtifact>, order: Option<&PageOrder>) -> Vec<PageArtifact> {
        let Some(order) = order else { return pages };
        let mut by_id: HashMap<String, Vec<PageArtifact>> = HashMap::new();
        let mut rest = Vec::new();
        for page in pages {
            if order.pages.contains(&page.page_id) {
                by_id.entry(page.page_id.clone()).or_default().push(page);
            } else {
                rest.push(page);
            }
        }
        let mut ordered = Vec::new();
        for id in &order.pages {
            if let Some(mut found) = by_id.remove(id) {
                ordered.append(&mut found);
            }
        }
        let (drawn, pdfs): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|p| p.generation != FormatGeneration::Pdf);
        ordered.extend(drawn);
        ordered.extend(pdfs);
        ordered
    }

    /// Runs the conversion state machine for one notebook.
    pub async fn convert_notebook(
        &self,
        document: &NotebookDescriptor,
        folder: &[String],
        cancel: &CancellationToken,
    ) -> Result<ConversionOutcome, ConvertError> {
        let safe_name = safe_document_name(document);
        let mut out_dir = self.output_root.clone();
        for component in folder {
            out_dir.push(component);
        }

        let mut outcome = ConversionOutcome {
            name: document.display_name.clone(),
            folder: folder.to_vec(),
            ..ConversionOutcome::default()
        };

        let pages = self.collect_pages(&document.id)?;
        for page in &pages {
            if matches!(page.generation, FormatGeneration::V3 | FormatGeneration::V4) {
                *outcome.unsupported.entry(page.generation).or_insert(0) += 1;
            }
        }

        // Nothing backed up for this notebook: silently nothing to do.
        if pages.is_empty() {
            return Ok(outcome);
        }

        let order = read_page_order(&self.files_dir.join(format!("{}.content", document.id)));

        // Scratch space for per-page artifacts; dropped (and deleted) on
        // every exit path, merge failures and cancellation included.
        let scratch = tempfile::tempdir()?;

        // Whole-document attempt: one batched render covering the
        // notebook directory, applicable only to a uniform batch-capable
        // generation.
        let uniform = pages
            .iter()
            .all(|p| p.generation == pages[0].generation)
            .then(|| pages[0].generation);
        if let Some(generation) = uniform
            && self.renderer.supports_batch(generation)
        {
            let whole = scratch.path().join("document.pdf");
            let notebook_dir = self.files_dir.join(&document.id);
            match self.renderer.render_document(&notebook_dir, &whole).await {
                Ok(()) => {
                    let final_pdf = out_dir.join(format!("{safe_name}.pdf"));
                    tokio::fs::create_dir_all(&out_dir).await?;
                    tokio::fs::copy(&whole, &final_pdf).await?;
                    *outcome.converted.entry(generation).or_insert(0) += pages.len();
                    outcome.outputs.push(final_pdf);
                    return Ok(outcome);
                }
                Err(err) => {
                    if self.verbose {
                        eprintln!(
                            "[remsync] whole-document render failed for {:?}, trying per page: {err}",
                            document.display_name
                        );
                    }
                }
            }
        }

        // Per-page attempt, in declared order.
        let ordered = Self::order_pages(pages, order.as_ref());
        let mut page_pdfs = Vec::new();
        let mut rendered_templates: HashMap<String, Option<PathBuf>> = HashMap::new();
        for (i, page) in ordered.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let target = scratch.path().join(format!("page_{:03}.pdf", i + 1));
            match page.generation {
                // No strategy exists for v3; detected-only.
                FormatGeneration::V3 | FormatGeneration::Unknown => continue,
                FormatGeneration::Pdf => {
                    if tokio::fs::copy(&page.path, &target).await.is_ok() {
                        *outcome.converted.entry(FormatGeneration::Pdf).or_insert(0) += 1;
                        page_pdfs.push(target);
                    }
                }
                generation => {
                    match self.renderer.render_page(&page.path, generation, &target).await {
                        Ok(()) => {
                            let page_pdf = self
                                .apply_template(page, &target, order.as_ref(), &mut rendered_templates, scratch.path())
                                .await;
                            *outcome.converted.entry(generation).or_insert(0) += 1;
                            page_pdfs.push(page_pdf);
                        }
                        Err(err) => {
                            // Contained: this page is skipped, the rest of
                            // the notebook continues.
                            if self.verbose {
                                eprintln!(
                                    "[remsync] page {} of {:?} failed: {err}",
                                    page.page_id, document.display_name
                                );
                            }
                        }
                    }
                }
            }
        }

        if !page_pdfs.is_empty() {
            let final_pdf = out_dir.join(format!("{safe_name}.pdf"));
            self.assembler.merge(&page_pdfs, &final_pdf).await?;
            outcome.outputs.push(final_pdf);
        }

        if !outcome.unsupported.is_empty() {
            let sidecar = self.write_unsupported_note(document, &safe_name, &out_dir, &outcome).await?;
            outcome.outputs.push(sidecar);
        }

        Ok(outcome)
    }

    /// Composites the declared background template beneath a rendered
    /// content page. Every failure mode falls back silently to the bare
    /// content page.
    async fn apply_template(
        &self,
        page: &PageArtifact,
        content: &Path,
        order: Option<&PageOrder>,
        rendered: &mut HashMap<String, Option<PathBuf>>,
        scratch: &Path,
    ) -> PathBuf {
        if !self.renderer.has_template_library() {
            return content.to_path_buf();
        }
        let declared = order.and_then(|o| o.templates.get(&page.page_id)).map(String::as_str);
        let Some(name) = overlay_template(declared) else {
            return content.to_path_buf();
        };

        // Render each named template once per notebook.
        let background = match rendered.get(name) {
            Some(cached) => cached.clone(),
            None => {
                let target = scratch.join(format!("template_{:03}.pdf", rendered.len() + 1));
                let result = match self.renderer.render_template(name, &target).await {
                    Ok(()) => Some(target),
                    Err(err) => {
                        if self.verbose {
                            eprintln!("[remsync] template {name:?} failed to render: {err}");
                        }
                        None
                    }
                };
                rendered.insert(name.to_string(), result.clone());
                result
            }
        };
        let Some(background) = background else {
            return content.to_path_buf();
        };

        let merged = content.with_extension("composited.pdf");
        match self.overlay.composite(content, &background, &merged).await {
            Ok(()) => merged,
            Err(err) => {
                if self.verbose {
                    eprintln!("[remsync] overlay failed for page {}: {err}", page.page_id);
                }
                content.to_path_buf()
            }
        }
    }

    /// Placeholder sidecar recording detected-but-unsupported pages.
    async fn write_unsupported_note(
        &self,
        document: &NotebookDescriptor,
        safe_name: &str,
        out_dir: &Path,
        outcome: &ConversionOutcome,
    ) -> io::Result<PathBuf> {
        let mut note = format!(
            "Notebook: {}\nUUID: {}\n\nDetected unsupported page formats:\n",
            document.display_name, document.id
        );
        for (generation, count) in &outcome.unsupported {
            note.push_str(&format!("  - {} pages: {count}\n", generation.label()));
        }
        note.push_str("\nKeep these files; a future converter may handle them.\n");

        tokio::fs::create_dir_all(out_dir).await?;
        let path = out_dir.join(format!("{safe_name}_unsupported.txt"));
        tokio::fs::write(&path, note).await?;
        Ok(path)
    }
}

/// Sanitized output file stem; falls back to a uuid-derived name when the
/// display name sanitizes to nothing.
fn safe_document_name(document: &NotebookDescriptor) -> String {
    let name = sanitize_name(&document.display_name);
    if name.is_empty() {
        format!("notebook_{}", &document.id[..document.id.len().min(8)])
    } else {
        name
    }
}
