use std::io::Cursor;

use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{Exif, Field, In, Tag, Value};

use crate::models::PhotoExif;

/// Camera fields plus the raw orientation code, which only matters while
/// the image is being decoded and is not persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifSummary {
    pub exif: PhotoExif,
    pub orientation: Option<u32>,
}

impl ExifSummary {
    pub fn date_taken(&self) -> Option<DateTime<Utc>> {
        self.exif.date_time_original.as_deref().and_then(parse_exif_date)
    }
}

/// Read the primary IFD of the container. Files without EXIF yield `None`.
pub fn generate_exif(bytes: &[u8]) -> Option<ExifSummary> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;

    Some(ExifSummary {
        exif: PhotoExif {
            make: ascii(&exif, Tag::Make),
            model: ascii(&exif, Tag::Model),
            lens_make: ascii(&exif, Tag::LensMake),
            lens_model: ascii(&exif, Tag::LensModel),
            f_number: rational(&exif, Tag::FNumber),
            exposure_time: field(&exif, Tag::ExposureTime).and_then(exposure_time),
            iso: field(&exif, Tag::PhotographicSensitivity).and_then(|f| f.value.get_uint(0)),
            focal_length: rational(&exif, Tag::FocalLength),
            date_time_original: ascii(&exif, Tag::DateTimeOriginal),
        },
        orientation: field(&exif, Tag::Orientation).and_then(|f| f.value.get_uint(0)),
    })
}

/// EXIF timestamps carry no zone; they are read as UTC.
pub fn parse_exif_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn field(exif: &Exif, tag: Tag) -> Option<&Field> {
    exif.get_field(tag, In::PRIMARY)
}

fn ascii(exif: &Exif, tag: Tag) -> Option<String> {
    let Value::Ascii(ref values) = field(exif, tag)?.value else {
        return None;
    };
    let text = String::from_utf8_lossy(values.first()?);
    let text = text.trim_end_matches('\0').trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn rational(exif: &Exif, tag: Tag) -> Option<f64> {
    match field(exif, tag)?.value {
        Value::Rational(ref values) => values.first().filter(|r| r.denom != 0).map(|r| r.to_f64()),
        _ => None,
    }
}

fn exposure_time(field: &Field) -> Option<String> {
    match field.value {
        Value::Rational(ref values) => {
            let r = values.first().filter(|r| r.denom != 0)?;
            if r.num != 0 && r.num < r.denom && r.denom % r.num == 0 {
                Some(format!("1/{}", r.denom / r.num))
            } else {
                Some(format!("{}", r.to_f64()))
            }
        }
        _ => None,
    }
}
