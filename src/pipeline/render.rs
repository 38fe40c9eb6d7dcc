//! PDF rasterisation: one staged image file per page via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and not
//! async-aware. [`render_document`] moves the whole rasterisation onto
//! tokio's blocking pool so one large statement never stalls the workers
//! serving other documents.
//!
//! ## File naming
//!
//! Pages are written as `page_000.jpg`, `page_001.jpg`, … The width of the
//! index grows with the page count, so lexicographic and numeric order
//! always agree.

use crate::config::{PageImageFormat, PagePolicy, PipelineConfig};
use crate::error::StatementError;
use crate::model::{OmittedPage, PageImage, RenderedDocument};
use crate::pipeline::encode::encode_page;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns a document into ordered page images inside `output_dir`.
///
/// Implementations are blocking; callers go through [`render_document`].
pub trait Rasterizer: Send + Sync {
    fn render(&self, document: &Path, output_dir: &Path) -> Result<RenderedDocument, StatementError>;
}

/// Run a rasterizer on the blocking pool.
pub async fn render_document(
    rasterizer: Arc<dyn Rasterizer>,
    document: &Path,
    output_dir: &Path,
) -> Result<RenderedDocument, StatementError> {
    let document = document.to_path_buf();
    let output_dir = output_dir.to_path_buf();

    tokio::task::spawn_blocking(move || rasterizer.render(&document, &output_dir))
        .await
        .map_err(|e| StatementError::Internal(format!("Render task panicked: {}", e)))?
}

/// Deterministic, zero-padded file name for page `index` of `page_count`.
pub fn page_file_name(index: usize, page_count: usize, format: PageImageFormat) -> String {
    let width = page_count.saturating_sub(1).to_string().len().max(3);
    format!("page_{index:0width$}.{}", format.extension())
}

/// pdfium-backed [`Rasterizer`].
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    lib_path: Option<PathBuf>,
    max_pixels: u32,
    format: PageImageFormat,
    jpeg_quality: u8,
    policy: PagePolicy,
}

impl PdfiumRasterizer {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            lib_path: config.pdfium_lib_path.clone(),
            max_pixels: config.max_rendered_pixels,
            format: config.image_format,
            jpeg_quality: config.jpeg_quality,
            policy: config.page_policy,
        }
    }

    fn render_page(
        &self,
        pages: &PdfPages,
        idx: usize,
        page_count: usize,
        render_config: &PdfRenderConfig,
        output_dir: &Path,
    ) -> Result<PageImage, StatementError> {
        let page = pages
            .get(idx as u16)
            .map_err(|e| StatementError::Rasterization {
                page: Some(idx),
                detail: format!("{:?}", e),
            })?;

        let bitmap =
            page.render_with_config(render_config)
                .map_err(|e| StatementError::Rasterization {
                    page: Some(idx),
                    detail: format!("{:?}", e),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        let bytes = encode_page(&image, self.format, self.jpeg_quality).map_err(|e| {
            StatementError::Rasterization {
                page: Some(idx),
                detail: format!("image encoding failed: {}", e),
            }
        })?;

        let path = output_dir.join(page_file_name(idx, page_count, self.format));
        std::fs::write(&path, bytes).map_err(|e| StatementError::staging(&path, e))?;
        info!("Created image: {}", path.display());

        Ok(PageImage { index: idx, path })
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn render(&self, document: &Path, output_dir: &Path) -> Result<RenderedDocument, StatementError> {
        check_pdf_magic(document)?;

        let pdfium = bind_pdfium(self.lib_path.as_deref())?;
        info!("Opening PDF file: {}", document.display());
        let pdf = pdfium
            .load_pdf_from_file(document, None)
            .map_err(|e| StatementError::Rasterization {
                page: None,
                detail: format!("{:?}", e),
            })?;

        let pages = pdf.pages();
        let page_count = pages.len() as usize;
        debug!("PDF has {} pages", page_count);

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut rendered = RenderedDocument {
            page_count,
            pages: Vec::with_capacity(page_count),
            failed: Vec::new(),
        };

        for idx in 0..page_count {
            match self.render_page(&pages, idx, page_count, &render_config, output_dir) {
                Ok(image) => rendered.pages.push(image),
                Err(StatementError::Rasterization { detail, .. })
                    if self.policy == PagePolicy::SkipFailed =>
                {
                    warn!("Skipping page {}: {}", idx + 1, detail);
                    rendered.failed.push(OmittedPage {
                        page: idx,
                        reason: detail,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(rendered)
    }
}

/// Reject anything that is not a PDF before handing it to pdfium.
fn check_pdf_magic(path: &Path) -> Result<(), StatementError> {
    let mut file = std::fs::File::open(path).map_err(|e| StatementError::Rasterization {
        page: None,
        detail: format!("cannot read '{}': {}", path.display(), e),
    })?;

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == b"%PDF" => Ok(()),
        Ok(()) => Err(StatementError::NotAPdf {
            path: path.to_path_buf(),
            magic: magic.to_vec(),
        }),
        // Shorter than the magic itself; `magic` is unspecified after a
        // failed read_exact, so report the file's actual bytes.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(StatementError::NotAPdf {
            path: path.to_path_buf(),
            magic: std::fs::read(path).unwrap_or_default(),
        }),
        Err(e) => Err(StatementError::Rasterization {
            page: None,
            detail: format!("cannot read '{}': {}", path.display(), e),
        }),
    }
}

/// Bind an explicit library (file or directory), else `./`, else the system
/// library.
fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, StatementError> {
    let bindings = match lib_path {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| StatementError::PdfiumBinding(e.to_string()))?;

    Ok(Pdfium::new(bindings))
}
