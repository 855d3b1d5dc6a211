//! Deterministic stand-ins for the ONNX models plus document builders.
//!
//! Test images encode what the fake detector should see: the red channel of
//! pixel (0, 0) is the face count, the green channel selects the eye shape
//! (0 open, 1 closed, 2 no landmarks). Face `i` is the 16×16 square at
//! `x = 16 * i, y = 4`, filled with its colour. The fake extractor embeds a
//! crop as its mean colour scaled to `[0, 1]`, so distinct solid colours give
//! distinct identities.

use crate::engine::{spawn_workers, EngineHandle, ModelSet};
use image::{ImageFormat, Rgb, RgbImage};
use lopdf::{dictionary, Document, Object, Stream};
use rollcall_core::{
    BoundingBox, DetectorError, Embedding, EmbeddingExtractor, ExtractorError, FaceDetection,
    FaceDetector, FaceLandmarks,
};
use std::io::Cursor;

pub const FACE_SIZE: u32 = 16;
pub const FACE_TOP: u32 = 4;
pub const FAKE_DIMENSION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eyes {
    Open,
    Closed,
    Missing,
}

pub struct FakeDetector;

impl FaceDetector for FakeDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        let marker = image.get_pixel(0, 0).0;
        let eyes = match marker[1] {
            0 => Eyes::Open,
            1 => Eyes::Closed,
            _ => Eyes::Missing,
        };
        Ok((0..marker[0] as u32)
            .map(|i| {
                let x = (i * FACE_SIZE) as f32;
                let y = FACE_TOP as f32;
                FaceDetection {
                    bbox: BoundingBox {
                        x,
                        y,
                        width: FACE_SIZE as f32,
                        height: FACE_SIZE as f32,
                    },
                    confidence: 0.9 - i as f32 * 0.01,
                    landmarks: landmarks(x, y, eyes),
                }
            })
            .collect())
    }
}

fn landmarks(x: f32, y: f32, eyes: Eyes) -> Option<FaceLandmarks> {
    let lid = match eyes {
        Eyes::Open => 1.5,
        Eyes::Closed => 0.0,
        Eyes::Missing => return None,
    };
    let mut points = vec![(x + 8.0, y + 8.0); 68];
    for (start, cx) in [(36usize, x + 4.0), (42, x + 12.0)] {
        let cy = y + 6.0;
        let eye = [
            (cx - 2.0, cy),
            (cx - 1.0, cy - lid),
            (cx + 1.0, cy - lid),
            (cx + 2.0, cy),
            (cx + 1.0, cy + lid),
            (cx - 1.0, cy + lid),
        ];
        points[start..start + 6].copy_from_slice(&eye);
    }
    Some(FaceLandmarks::new(points))
}

pub struct FakeExtractor;

impl EmbeddingExtractor for FakeExtractor {
    fn dimension(&self) -> usize {
        FAKE_DIMENSION
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError> {
        let pixels = face.width() as f32 * face.height() as f32;
        if pixels == 0.0 {
            return Err(ExtractorError::EmptyCrop);
        }
        let mut sums = [0.0f32; 3];
        for pixel in face.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += channel as f32;
            }
        }
        Ok(Embedding::new(
            sums.iter().map(|s| s / pixels / 255.0).collect(),
        ))
    }
}

pub fn fake_engine(workers: usize) -> EngineHandle {
    let sets = (0..workers)
        .map(|_| ModelSet {
            detector: Box::new(FakeDetector),
            extractor: Box::new(FakeExtractor),
        })
        .collect();
    spawn_workers(sets, FAKE_DIMENSION).unwrap()
}

/// An image containing one face per colour, with open eyes.
pub fn face_image(colors: &[[u8; 3]]) -> RgbImage {
    face_image_with(colors, Eyes::Open)
}

pub fn face_image_with(colors: &[[u8; 3]], eyes: Eyes) -> RgbImage {
    let width = FACE_SIZE * (colors.len() as u32).max(1);
    let mut image = RgbImage::new(width, FACE_TOP + FACE_SIZE + 4);
    for (i, color) in colors.iter().enumerate() {
        let x0 = i as u32 * FACE_SIZE;
        for y in FACE_TOP..FACE_TOP + FACE_SIZE {
            for x in x0..x0 + FACE_SIZE {
                image.put_pixel(x, y, Rgb(*color));
            }
        }
    }
    let eye_code = match eyes {
        Eyes::Open => 0,
        Eyes::Closed => 1,
        Eyes::Missing => 2,
    };
    image.put_pixel(0, 0, Rgb([colors.len() as u8, eye_code, 0]));
    image
}

pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// A PDF with one page per entry, each page carrying the given images as
/// uncompressed RGB XObjects.
pub fn build_pdf(pages: &[Vec<RgbImage>]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::new();
    for images in pages {
        let mut xobjects = lopdf::Dictionary::new();
        let mut content = Vec::new();
        for (i, image) in images.iter().enumerate() {
            let stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => i64::from(image.width()),
                    "Height" => i64::from(image.height()),
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                },
                image.as_raw().clone(),
            );
            let image_id = doc.add_object(stream);
            let name = format!("Im{i}");
            content.extend_from_slice(format!("q 100 0 0 100 0 0 cm /{name} Do Q\n").as_bytes());
            xobjects.set(name, image_id);
        }
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => xobjects },
        });
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

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::liveness;

    #[test]
    fn test_fake_detector_reads_marker() {
        let image = face_image(&[[255, 0, 0], [0, 0, 255]]);
        let faces = FakeDetector.detect(&image).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].bbox.x, 16.0);
        assert!(liveness::is_live(faces[0].landmarks.as_ref().unwrap()));

        let closed = face_image_with(&[[255, 0, 0]], Eyes::Closed);
        let faces = FakeDetector.detect(&closed).unwrap();
        assert!(!liveness::is_live(faces[0].landmarks.as_ref().unwrap()));
    }

    #[test]
    fn test_fake_extractor_is_mean_colour() {
        let crop = RgbImage::from_pixel(4, 4, Rgb([255, 0, 51]));
        let embedding = FakeExtractor.embed(&crop).unwrap();
        assert_eq!(embedding.values, vec![1.0, 0.0, 0.2]);
    }
}
