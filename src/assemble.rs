//! Document assembly: lay out completed pages into the final print PDF.
//!
//! Cover pages are sized from the cover dimensions of the book's print
//! format, interior pages from the interior dimensions; a book without a
//! print format falls back to the default square trim. Images are scaled to
//! fit the printable area (page minus margins) preserving aspect ratio and
//! centered. Any failure here is fatal to the book, even when every page
//! generated successfully.

use std::path::Path;

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, StringFormat, dictionary};

use crate::error::GenerationError;
use crate::model::{Book, Page, PageKind, PrintFormat};

const POINTS_PER_MM: f64 = 72.0 / 25.4;

pub fn mm_to_pt(mm: f64) -> f32 {
    (mm * POINTS_PER_MM) as f32
}

/// Assemble `pages` (already filtered to completed, ascending page number)
/// into `books/<book_id>/book.pdf` under the data dir and return the relative
/// path. Blocking; callers run it on a blocking thread.
pub fn assemble(book: &Book, pages: &[Page], data_dir: &Path) -> Result<String, GenerationError> {
    if pages.is_empty() {
        return Err(GenerationError::Assembly("no completed pages to assemble".into()));
    }

    let format = book.print_format.clone().unwrap_or_default();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for page in pages {
        let (width_pt, height_pt) = page_size_pt(page.kind, &format);
        let margin_pt = mm_to_pt(format.margin_mm);

        let page_id = match page.kind {
            PageKind::Text => {
                let text = page.text_content.as_deref().unwrap_or_default();
                add_text_page(&mut doc, pages_id, font_id, width_pt, height_pt, margin_pt, text)?
            }
            PageKind::CoverFront
            | PageKind::CoverBack
            | PageKind::Intro
            | PageKind::Illustration
            | PageKind::ColoringPage => {
                let relative = page.local_asset_path.as_deref().ok_or_else(|| {
                    GenerationError::Assembly(format!(
                        "page {} has no materialized asset",
                        page.page_number
                    ))
                })?;
                let image_path = data_dir.join(relative);
                add_image_page(
                    &mut doc, pages_id, width_pt, height_pt, margin_pt, &image_path,
                )?
            }
        };
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let book_dir = data_dir.join("books").join(&book.book_id);
    std::fs::create_dir_all(&book_dir).map_err(|err| {
        GenerationError::Assembly(format!("create {}: {err}", book_dir.display()))
    })?;
    let out_path = book_dir.join("book.pdf");
    doc.save(&out_path).map_err(|err| {
        GenerationError::Assembly(format!("write {}: {err}", out_path.display()))
    })?;

    Ok(format!("books/{}/book.pdf", book.book_id))
}

fn page_size_pt(kind: PageKind, format: &PrintFormat) -> (f32, f32) {
    if kind.is_cover() {
        (mm_to_pt(format.cover_width_mm), mm_to_pt(format.cover_height_mm))
    } else {
        (
            mm_to_pt(format.interior_width_mm),
            mm_to_pt(format.interior_height_mm),
        )
    }
}

fn add_image_page(
    doc: &mut Document,
    pages_id: lopdf::ObjectId,
    width_pt: f32,
    height_pt: f32,
    margin_pt: f32,
    image_path: &Path,
) -> Result<lopdf::ObjectId, GenerationError> {
    let (pixel_width, pixel_height, jpeg) = encode_rgb_jpeg(image_path)?;

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => pixel_width as i64,
            "Height" => pixel_height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let placement = fit_rect(
        pixel_width as f32,
        pixel_height as f32,
        width_pt - 2.0 * margin_pt,
        height_pt - 2.0 * margin_pt,
    );
    let offset_x = margin_pt + placement.offset_x;
    let offset_y = margin_pt + placement.offset_y;

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(placement.width),
                    Object::Real(0.0),
                    Object::Real(0.0),
                    Object::Real(placement.height),
                    Object::Real(offset_x),
                    Object::Real(offset_y),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content
            .encode()
            .map_err(|err| GenerationError::Assembly(format!("encode page content: {err}")))?,
    ));

    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(width_pt),
            Object::Real(height_pt),
        ],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    }))
}

fn add_text_page(
    doc: &mut Document,
    pages_id: lopdf::ObjectId,
    font_id: lopdf::ObjectId,
    width_pt: f32,
    height_pt: f32,
    margin_pt: f32,
    text: &str,
) -> Result<lopdf::ObjectId, GenerationError> {
    let font_size = 14.0f32;
    let leading = 20.0f32;
    // Rough Helvetica average glyph width; enough for picture-book paragraphs.
    let chars_per_line = (((width_pt - 2.0 * margin_pt) / (font_size * 0.5)) as usize).max(8);
    let lines = wrap_text(text, chars_per_line);

    let block_height = leading * lines.len() as f32;
    let start_y = ((height_pt + block_height) / 2.0 - leading).min(height_pt - margin_pt - leading);

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(b"F1".to_vec()), Object::Real(font_size)],
        ),
        Operation::new("TL", vec![Object::Real(leading)]),
        Operation::new(
            "Td",
            vec![Object::Real(margin_pt), Object::Real(start_y.max(margin_pt))],
        ),
    ];
    for line in &lines {
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(encode_win_ansi(line), StringFormat::Literal)],
        ));
        operations.push(Operation::new("T*", vec![]));
    }
    operations.push(Operation::new("ET", vec![]));

    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content
            .encode()
            .map_err(|err| GenerationError::Assembly(format!("encode text content: {err}")))?,
    ));

    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(width_pt),
            Object::Real(height_pt),
        ],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        },
    }))
}

struct Placement {
    width: f32,
    height: f32,
    offset_x: f32,
    offset_y: f32,
}

/// Scale `(src_w, src_h)` to fit inside `(max_w, max_h)` preserving aspect
/// ratio, centered within the box.
fn fit_rect(src_w: f32, src_h: f32, max_w: f32, max_h: f32) -> Placement {
    let scale = (max_w / src_w).min(max_h / src_h);
    let width = src_w * scale;
    let height = src_h * scale;
    Placement {
        width,
        height,
        offset_x: (max_w - width) / 2.0,
        offset_y: (max_h - height) / 2.0,
    }
}

/// Decode any supported image and re-encode as RGB JPEG for embedding.
fn encode_rgb_jpeg(path: &Path) -> Result<(u32, u32, Vec<u8>), GenerationError> {
    let decoded = image::open(path).map_err(|err| {
        GenerationError::Assembly(format!("decode image {}: {err}", path.display()))
    })?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90);
    encoder
        .encode(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .map_err(|err| {
            GenerationError::Assembly(format!("encode jpeg for {}: {err}", path.display()))
        })?;

    Ok((width, height, jpeg))
}

/// Base-14 Helvetica with WinAnsiEncoding is single-byte cp1252. Latin-1
/// characters map directly, a handful of cp1252 punctuation points are
/// remapped, and anything else is replaced.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match u32::from(c) {
            0x20..=0x7E | 0xA0..=0xFF => c as u8,
            0x2018 => 0x91,
            0x2019 => 0x92,
            0x201C => 0x93,
            0x201D => 0x94,
            0x2013 => 0x96,
            0x2014 => 0x97,
            0x2026 => 0x85,
            0x20AC => 0x80,
            _ => b'?',
        })
        .collect()
}

fn wrap_text(text: &str, chars_per_line: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > chars_per_line
            {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}
