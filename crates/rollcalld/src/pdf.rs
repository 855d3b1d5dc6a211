//! Raster image extraction from PDF documents.
//!
//! Walks every page's `/Resources /XObject` dictionary (following `/Parent`
//! for inherited resources) and writes each `/Subtype /Image` stream out as an
//! RGB PNG. An image object shared by several pages is written once.

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// Page trees deeper than this are treated as malformed.
const MAX_PARENT_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("malformed document: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("extraction cancelled")]
    Cancelled,
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// The output of one extraction run.
#[derive(Debug, Default)]
pub struct Extraction {
    pub images: Vec<PathBuf>,
    /// Image objects that were found but could not be decoded.
    pub skipped: usize,
}

/// Extract every embedded raster image of `bytes` into `out_dir`.
///
/// `cancel` is checked before each image is written; once it fires no further
/// file is created.
pub fn extract_images(
    bytes: &[u8],
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Extraction, PdfError> {
    let doc = Document::load_mem(bytes)?;
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut extraction = Extraction::default();

    for (page_number, page_id) in doc.get_pages() {
        let Some(resources) = page_resources(&doc, page_id) else {
            continue;
        };
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|obj| resolve_dict(&doc, obj))
        else {
            continue;
        };

        for (_, value) in xobjects.iter() {
            let Ok(object_id) = value.as_reference() else {
                continue;
            };
            if !seen.insert(object_id) {
                continue;
            }
            let Ok(stream) = doc.get_object(object_id).and_then(Object::as_stream) else {
                continue;
            };
            if !is_image(stream) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(PdfError::Cancelled);
            }

            match decode_image(stream) {
                Ok(image) => {
                    let path = out_dir.join(format!(
                        "page{page_number}_obj{}_{}.png",
                        object_id.0, object_id.1
                    ));
                    image
                        .save_with_format(&path, ImageFormat::Png)
                        .map_err(|source| PdfError::Write {
                            path: path.clone(),
                            source,
                        })?;
                    extraction.images.push(path);
                }
                Err(reason) => {
                    tracing::warn!(
                        page = page_number,
                        object = object_id.0,
                        reason = %reason,
                        "skipping undecodable image"
                    );
                    extraction.skipped += 1;
                }
            }
        }
    }

    tracing::debug!(
        images = extraction.images.len(),
        skipped = extraction.skipped,
        "pdf images extracted"
    );
    Ok(extraction)
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    resolve(doc, obj)?.as_dict().ok()
}

fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PARENT_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve_dict(doc, resources);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn is_image(stream: &Stream) -> bool {
    matches!(stream.dict.get(b"Subtype").and_then(Object::as_name), Ok(b"Image"))
}

fn filter_name(dict: &Dictionary) -> Option<Vec<u8>> {
    match dict.get(b"Filter").ok()? {
        Object::Name(name) => Some(name.clone()),
        Object::Array(filters) if filters.len() == 1 => filters[0].as_name().ok().map(<[u8]>::to_vec),
        Object::Array(_) => Some(b"Chained".to_vec()),
        _ => None,
    }
}

fn dimension(dict: &Dictionary, key: &[u8]) -> Result<u32, String> {
    let value = dict
        .get(key)
        .and_then(Object::as_i64)
        .map_err(|_| format!("missing /{}", String::from_utf8_lossy(key)))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("bad /{} {value}", String::from_utf8_lossy(key)))
}

fn decode_image(stream: &Stream) -> Result<RgbImage, String> {
    match filter_name(&stream.dict).as_deref() {
        Some(b"DCTDecode") => image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| e.to_string()),
        Some(b"FlateDecode") => {
            let samples = stream.decompressed_content().map_err(|e| e.to_string())?;
            samples_to_rgb(&stream.dict, samples)
        }
        None => samples_to_rgb(&stream.dict, stream.content.clone()),
        Some(other) => Err(format!(
            "unsupported filter {}",
            String::from_utf8_lossy(other)
        )),
    }
}

/// Interpret raw 8-bit samples; the channel count is inferred from the length.
fn samples_to_rgb(dict: &Dictionary, samples: Vec<u8>) -> Result<RgbImage, String> {
    let width = dimension(dict, b"Width")?;
    let height = dimension(dict, b"Height")?;
    let bpc = dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bpc != 8 {
        return Err(format!("unsupported BitsPerComponent {bpc}"));
    }

    let too_large = || format!("{width}x{height} image is too large");
    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(too_large)?;
    let rgb_len = pixels.checked_mul(3).ok_or_else(too_large)?;
    if samples.len() == rgb_len {
        RgbImage::from_raw(width, height, samples).ok_or_else(|| "bad RGB buffer".to_string())
    } else if samples.len() == pixels {
        GrayImage::from_raw(width, height, samples)
            .map(|gray| DynamicImage::ImageLuma8(gray).to_rgb8())
            .ok_or_else(|| "bad gray buffer".to_string())
    } else {
        Err(format!(
            "{} sample bytes for a {width}x{height} image",
            samples.len()
        ))
    }
}
