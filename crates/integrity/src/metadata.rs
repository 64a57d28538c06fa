use std::collections::BTreeMap;
use std::io::Cursor;

use chrono::NaiveDateTime;
use exif::{Field, In, Reader, Tag, Value};
use serde::Serialize;

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Capture metadata parsed out of an image. Extraction never fails: a
/// corrupt or missing EXIF block yields `has_exif = false` plus `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExifMetadata {
    pub has_exif: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub captured_at: Option<NaiveDateTime>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub raw: BTreeMap<String, BTreeMap<String, String>>,
    pub error: Option<String>,
}

impl ExifMetadata {
    pub fn raw_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.raw).unwrap_or_else(|_| serde_json::json!({}))
    }
}

pub fn extract_exif(data: &[u8]) -> ExifMetadata {
    match read_exif(data) {
        Ok(meta) => meta,
        Err(err) => ExifMetadata {
            error: Some(err),
            ..ExifMetadata::default()
        },
    }
}

fn read_exif(data: &[u8]) -> Result<ExifMetadata, String> {
    let exif = Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .map_err(|err| err.to_string())?;

    let mut raw: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for field in exif.fields() {
        raw.entry(ifd_label(field.ifd_num).to_string())
            .or_default()
            .insert(field.tag.to_string(), stringify_value(field));
    }

    let gps_latitude = gps_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef);
    let gps_longitude = gps_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef);

    let captured_at = ascii_field(&exif, Tag::DateTimeOriginal)
        .or_else(|| ascii_field(&exif, Tag::DateTime))
        .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), EXIF_DATETIME_FORMAT).ok());

    Ok(ExifMetadata {
        has_exif: true,
        gps_latitude,
        gps_longitude,
        captured_at,
        camera_make: ascii_field(&exif, Tag::Make),
        camera_model: ascii_field(&exif, Tag::Model),
        raw,
        error: None,
    })
}

fn ifd_label(ifd: In) -> &'static str {
    if ifd == In::PRIMARY {
        "primary"
    } else if ifd == In::THUMBNAIL {
        "thumbnail"
    } else {
        "other"
    }
}

fn stringify_value(field: &Field) -> String {
    match &field.value {
        Value::Ascii(parts) => parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).trim_end_matches('\0').to_string())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Undefined(bytes, _) => match std::str::from_utf8(bytes) {
            Ok(s) => s.trim_end_matches('\0').to_string(),
            Err(_) => hex::encode(bytes),
        },
        _ => field.display_value().to_string(),
    }
}

fn ascii_field(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let Value::Ascii(parts) = &field.value else {
        return None;
    };
    let first = parts.first()?;
    let s = String::from_utf8_lossy(first)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    (!s.is_empty()).then_some(s)
}

fn gps_coordinate(exif: &exif::Exif, value_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() < 3 {
        return None;
    }

    let hemisphere = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(|f| match &f.value {
            Value::Ascii(v) => v.first().and_then(|b| b.first().copied()),
            _ => None,
        });

    dms_to_decimal(
        parts[0].to_f64(),
        parts[1].to_f64(),
        parts[2].to_f64(),
        hemisphere,
    )
}

/// Degrees/minutes/seconds to signed decimal degrees. `S` and `W` negate.
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, hemisphere: Option<u8>) -> Option<f64> {
    let value = degrees + minutes / 60.0 + seconds / 3600.0;
    if !value.is_finite() {
        return None;
    }
    match hemisphere {
        Some(b'S') | Some(b'W') | Some(b's') | Some(b'w') => Some(-value),
        _ => Some(value),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn ifd_entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]) {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value);
    }

    /// Minimal JPEG carrying an EXIF block with DateTime and GPS tags.
    pub(crate) fn jpeg_with_exif(
        datetime: &str,
        lat: [u32; 3],
        lat_ref: u8,
        lon: [u32; 3],
        lon_ref: u8,
    ) -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II\x2A\x00");
        tiff.extend_from_slice(&8u32.to_le_bytes());

        tiff.extend_from_slice(&2u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x0132, 2, 20, 38u32.to_le_bytes());
        ifd_entry(&mut tiff, 0x8825, 4, 1, 58u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());

        let mut dt = datetime.as_bytes().to_vec();
        dt.resize(20, 0);
        tiff.extend_from_slice(&dt);

        tiff.extend_from_slice(&4u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x0001, 2, 2, [lat_ref, 0, 0, 0]);
        ifd_entry(&mut tiff, 0x0002, 5, 3, 112u32.to_le_bytes());
        ifd_entry(&mut tiff, 0x0003, 2, 2, [lon_ref, 0, 0, 0]);
        ifd_entry(&mut tiff, 0x0004, 5, 3, 136u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());

        for v in lat.iter().chain(lon.iter()) {
            tiff.extend_from_slice(&v.to_le_bytes());
            tiff.extend_from_slice(&1u32.to_le_bytes());
        }

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
        let segment_len = (2 + 6 + tiff.len()) as u16;
        jpeg.extend_from_slice(&segment_len.to_be_bytes());
        jpeg.extend_from_slice(b"Exif\0\0");
        jpeg.extend_from_slice(&tiff);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn extracts_gps_and_capture_time_with_hemisphere_sign() {
        let jpeg = jpeg_with_exif("2026:03:01 12:00:00", [47, 36, 0], b'N', [122, 19, 48], b'W');
        let meta = extract_exif(&jpeg);

        assert!(meta.has_exif, "exif should be present: {:?}", meta.error);
        let lat = meta.gps_latitude.expect("latitude should be decoded");
        let lon = meta.gps_longitude.expect("longitude should be decoded");
        assert!((lat - 47.6).abs() < 1e-9);
        assert!((lon + 122.33).abs() < 1e-9);
        assert_eq!(
            meta.captured_at.map(|t| t.to_string()),
            Some("2026-03-01 12:00:00".to_string())
        );
        assert_eq!(
            meta.raw
                .get("primary")
                .and_then(|ifd| ifd.get("DateTime"))
                .map(String::as_str),
            Some("2026:03:01 12:00:00")
        );
    }

    #[test]
    fn corrupt_input_is_reported_not_raised() {
        let meta = extract_exif(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(!meta.has_exif);
        assert!(meta.error.is_some());
        assert!(meta.gps_latitude.is_none());

        let meta = extract_exif(b"%PDF-1.4 not an image");
        assert!(!meta.has_exif);
    }

    #[test]
    fn dms_conversion_negates_south_and_west() {
        assert_eq!(dms_to_decimal(10.0, 30.0, 0.0, Some(b'S')), Some(-10.5));
        assert_eq!(dms_to_decimal(10.0, 30.0, 0.0, Some(b'E')), Some(10.5));
        assert_eq!(dms_to_decimal(f64::NAN, 0.0, 0.0, None), None);
    }
}
