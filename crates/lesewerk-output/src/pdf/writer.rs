// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF writer: reconstruct paginated documents from recognition results using
// `printpdf` 0.8.
//
// printpdf 0.8 uses a data-oriented API: documents are built by constructing
// `PdfPage` structs containing `Vec<Op>` operation lists, then serialised via
// `PdfDocument::save()`.
//
// Page geometry maps one input pixel to one PDF point.  Recognition boxes use
// a top-left origin, PDF text a bottom-left one, so every y is flipped.

use lesewerk_core::error::LesewerkError;
use lesewerk_core::{PaperSize, TextBlock};
use printpdf::{
    BuiltinFont, Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Point, Pt, RawImage,
    RawImageData, RawImageFormat, TextItem, TextRenderingMode, XObjectTransform,
};
use tracing::{debug, info, instrument, warn};

const MM_PER_PT: f32 = 25.4 / 72.0;
const MIN_FONT_PT: f32 = 4.0;
const MAX_FONT_PT: f32 = 72.0;

/// One page of a reconstructed document.
#[derive(Debug, Clone, Default)]
pub struct PageLayout {
    /// Width and height of the recognised input in pixels.
    pub size: Option<(f32, f32)>,
    /// Encoded page image, drawn underneath the text in layered output.
    pub raster: Option<Vec<u8>>,
    pub blocks: Vec<TextBlock>,
}

/// Builds layered (image + invisible text) and text-only PDFs.
pub struct PdfWriter {
    /// Page size used when a page carries no geometry of its own.
    fallback: PaperSize,
    /// Title metadata embedded in the PDF /Info dictionary.
    title: String,
}

impl PdfWriter {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            fallback: PaperSize::A4,
            title: title.into(),
        }
    }

    /// Fallback page size in points.
    fn fallback_pt(&self) -> (f32, f32) {
        let (w_mm, h_mm) = self.fallback.dimensions_mm();
        (w_mm as f32 / MM_PER_PT, h_mm as f32 / MM_PER_PT)
    }

    /// Original imagery with a searchable, invisible text layer on top.
    #[instrument(skip(self, pages), fields(pages = pages.len()))]
    pub fn create_layered(&self, pages: &[PageLayout]) -> Result<Vec<u8>, LesewerkError> {
        info!(title = %self.title, "Creating layered PDF");
        let mut doc = PdfDocument::new(&self.title);
        let mut out_pages = Vec::with_capacity(pages.len());

        for page in pages {
            let mut ops = Vec::new();
            let mut image_size = None;

            if let Some(bytes) = &page.raster {
                match decode_raster(bytes) {
                    Ok(raw) => {
                        let (w, h) = (raw.width as f32, raw.height as f32);
                        let id = doc.add_image(&raw);
                        ops.push(Op::UseXobject {
                            id,
                            transform: XObjectTransform {
                                translate_x: Some(Pt(0.0)),
                                translate_y: Some(Pt(0.0)),
                                scale_x: Some(1.0),
                                scale_y: Some(1.0),
                                dpi: Some(72.0),
                                rotate: None,
                            },
                        });
                        image_size = Some((w, h));
                    }
                    Err(e) => warn!(error = %e, "page image unreadable, writing text layer only"),
                }
            }

            let (page_w, page_h) = image_size.or(page.size).unwrap_or_else(|| self.fallback_pt());
            // Scale boxes when the raster resolution differs from the recognised input.
            let (sx, sy) = match (image_size, page.size) {
                (Some((iw, ih)), Some((rw, rh))) if rw > 0.0 && rh > 0.0 => (iw / rw, ih / rh),
                _ => (1.0, 1.0),
            };

            ops.push(Op::SetTextRenderingMode {
                mode: TextRenderingMode::Invisible,
            });
            push_blocks(&mut ops, &page.blocks, page_h, sx, sy);
            out_pages.push(PdfPage::new(mm(page_w), mm(page_h), ops));
        }

        Ok(self.finish(doc, out_pages))
    }

    /// Blank pages with the recognised text drawn at its original positions.
    #[instrument(skip(self, pages), fields(pages = pages.len()))]
    pub fn create_text_layout(&self, pages: &[PageLayout]) -> Result<Vec<u8>, LesewerkError> {
        info!(title = %self.title, "Creating text-only PDF");
        let doc = PdfDocument::new(&self.title);
        let out_pages = pages
            .iter()
            .map(|page| {
                let (page_w, page_h) = page.size.unwrap_or_else(|| self.fallback_pt());
                let mut ops = Vec::new();
                push_blocks(&mut ops, &page.blocks, page_h, 1.0, 1.0);
                PdfPage::new(mm(page_w), mm(page_h), ops)
            })
            .collect();

        Ok(self.finish(doc, out_pages))
    }

    fn finish(&self, mut doc: PdfDocument, mut pages: Vec<PdfPage>) -> Vec<u8> {
        if pages.is_empty() {
            let (w, h) = self.fallback_pt();
            pages.push(PdfPage::new(mm(w), mm(h), Vec::new()));
        }
        doc.with_pages(pages);
        debug!(pages = doc.pages.len(), "PDF layout complete");

        let mut warnings: Vec<PdfWarnMsg> = Vec::new();
        doc.save(&PdfSaveOptions::default(), &mut warnings)
    }
}

fn mm(pt: f32) -> Mm {
    Mm(pt * MM_PER_PT)
}

/// Emit one text section per block, baseline at the bottom of its box.
fn push_blocks(ops: &mut Vec<Op>, blocks: &[TextBlock], page_h: f32, sx: f32, sy: f32) {
    for block in blocks {
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }
        let (x0, top, _, bottom) = block.bounds();
        let font_size = ((bottom - top) * sy * 0.8).clamp(MIN_FONT_PT, MAX_FONT_PT);

        ops.push(Op::StartTextSection);
        ops.push(Op::SetTextCursor {
            pos: Point {
                x: Pt(x0 * sx),
                y: Pt(page_h - bottom * sy),
            },
        });
        ops.push(Op::SetFontSizeBuiltinFont {
            size: Pt(font_size),
            font: BuiltinFont::Helvetica,
        });
        ops.push(Op::WriteTextBuiltinFont {
            items: vec![TextItem::Text(text.to_string())],
            font: BuiltinFont::Helvetica,
        });
        ops.push(Op::EndTextSection);
    }
}

/// Decode PNG/JPEG/... bytes into printpdf's RGB8 raw image.
fn decode_raster(bytes: &[u8]) -> Result<RawImage, LesewerkError> {
    let dynamic_image = ::image::load_from_memory(bytes)
        .map_err(|err| LesewerkError::ImageError(format!("failed to decode page image: {err}")))?;
    let width = dynamic_image.width() as usize;
    let height = dynamic_image.height() as usize;
    let rgb_image = dynamic_image.to_rgb8();
    Ok(RawImage {
        pixels: RawImageData::U8(rgb_image.into_raw()),
        width,
        height,
        data_format: RawImageFormat::RGB8,
        tag: Vec::new(),
    })
}
