use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Read, Write};
use std::path::Path;

use crate::pointcloud::PointCloud;

const MAX_POINT_STEP: usize = 1024;
const MAX_POINTS: usize = 50_000_000;

/// Error types for the PCD module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PcdError {
    /// Failed to read or write the PCD file
    #[error("Failed to access PCD file")]
    Io(#[from] std::io::Error),

    /// Unsupported header
    #[error("Unsupported PCD header")]
    UnsupportedProperty,

    /// Malformed PCD header
    #[error("Malformed PCD header")]
    MalformedHeader,

    /// Malformed point record in an ASCII body
    #[error("Malformed PCD point record at line {0}")]
    MalformedRecord(usize),

    /// Invalid PCD file extension
    #[error("Invalid PCD file extension. Got:{0}")]
    InvalidFileExtension(String),
}

/// Encoding of the point records following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcdEncoding {
    Ascii,
    Binary,
}

/// Describes a single field in a PCD point record
#[derive(Debug)]
struct PcdField {
    offset: usize, // byte offset within a binary point
    element: usize, // token index within an ascii point
    kind: char,    // PCD type: 'F' = float, 'U' = unsigned int, 'I' = signed int
}

#[derive(Debug)]
struct PcdLayout {
    fields: HashMap<String, PcdField>,
    point_step: usize, // total bytes per point
    num_elements: usize, // total tokens per ascii point
    num_points: usize,
    viewpoint: Option<[f64; 3]>,
    encoding: PcdEncoding,
}

impl PcdLayout {
    fn field(&self, name: &str) -> Result<&PcdField, PcdError> {
        self.fields.get(name).ok_or(PcdError::UnsupportedProperty)
    }

    fn normal_fields(&self) -> Option<[&PcdField; 3]> {
        let get = |long: &str, short: &str| self.fields.get(long).or_else(|| self.fields.get(short));
        Some([
            get("normal_x", "nx")?,
            get("normal_y", "ny")?,
            get("normal_z", "nz")?,
        ])
    }
}

/// Read a little-endian f32 from a byte buffer
#[inline]
fn read_f32(buf: &[u8], offset: usize) -> Result<f32, PcdError> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or(PcdError::UnsupportedProperty)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(slice);
    Ok(f32::from_le_bytes(bytes))
}

/// Read a little-endian u32 from a byte buffer
#[inline]
fn read_u32(buf: &[u8], offset: usize) -> Result<u32, PcdError> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or(PcdError::UnsupportedProperty)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(slice);
    Ok(u32::from_le_bytes(bytes))
}

fn unpack_rgb(rgb: u32) -> [u8; 3] {
    [
        ((rgb >> 16) & 0xFF) as u8,
        ((rgb >> 8) & 0xFF) as u8,
        (rgb & 0xFF) as u8,
    ]
}

fn parse_pcd_layout<R: BufRead>(reader: &mut R) -> Result<PcdLayout, PcdError> {
    let mut field_names: Vec<String> = Vec::new();
    let mut sizes = Vec::new();
    let mut types = Vec::new();
    let mut counts = Vec::new();
    let mut points = 0usize;
    let mut viewpoint = None;

    let encoding = loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(PcdError::MalformedHeader);
        }
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }

        if line.starts_with("DATA") {
            match line {
                "DATA binary" => break PcdEncoding::Binary,
                "DATA ascii" => break PcdEncoding::Ascii,
                _ => return Err(PcdError::UnsupportedProperty),
            }
        }

        let mut it = line.split_whitespace();
        match it.next() {
            Some("SIZE") => {
                sizes = it
                    .map(|v| v.parse::<usize>().map_err(|_| PcdError::UnsupportedProperty))
                    .collect::<Result<Vec<_>, _>>()?;
            }
            Some("TYPE") => {
                types = it
                    .map(|v| v.chars().next().ok_or(PcdError::UnsupportedProperty))
                    .collect::<Result<Vec<_>, _>>()?;
            }
            Some("COUNT") => {
                counts = it
                    .map(|v| v.parse::<usize>().map_err(|_| PcdError::UnsupportedProperty))
                    .collect::<Result<Vec<_>, _>>()?;
            }
            Some("POINTS") => {
                let token = it.next().ok_or(PcdError::UnsupportedProperty)?;
                points = token
                    .parse::<usize>()
                    .map_err(|_| PcdError::UnsupportedProperty)?;
            }
            Some("VIEWPOINT") => {
                let values = it
                    .map(|v| v.parse::<f64>().map_err(|_| PcdError::MalformedHeader))
                    .collect::<Result<Vec<_>, _>>()?;
                if values.len() != 7 {
                    return Err(PcdError::MalformedHeader);
                }
                // only the translation part is kept, orientation is assumed identity
                if values[..3].iter().any(|v| *v != 0.0) {
                    viewpoint = Some([values[0], values[1], values[2]]);
                }
            }
            Some("FIELDS") => field_names = it.map(String::from).collect(),
            _ => {}
        }
    };

    if field_names.is_empty()
        || sizes.len() != field_names.len()
        || types.len() != field_names.len()
        || (!counts.is_empty() && counts.len() != field_names.len())
    {
        return Err(PcdError::UnsupportedProperty);
    }

    let mut offset = 0usize;
    let mut element = 0usize;
    let mut fields = HashMap::new();

    for (i, name) in field_names.iter().enumerate() {
        // If COUNT is omitted, PCD spec defines default count as 1
        let count = counts.get(i).copied().unwrap_or(1);
        let size = sizes[i];
        let kind = types[i];

        match name.as_str() {
            "x" | "y" | "z" | "normal_x" | "normal_y" | "normal_z" | "nx" | "ny" | "nz" => {
                if !(size == 4 && count == 1 && kind == 'F') {
                    return Err(PcdError::UnsupportedProperty);
                }
            }
            "rgb" => {
                if !(size == 4 && count == 1 && matches!(kind, 'U' | 'I' | 'F')) {
                    return Err(PcdError::UnsupportedProperty);
                }
            }
            _ => {}
        }

        if fields.contains_key(name) {
            return Err(PcdError::MalformedHeader);
        }
        fields.insert(
            name.clone(),
            PcdField {
                offset,
                element,
                kind,
            },
        );

        let field_bytes = size.checked_mul(count).ok_or(PcdError::MalformedHeader)?;
        offset = offset
            .checked_add(field_bytes)
            .ok_or(PcdError::MalformedHeader)?;
        element += count;

        if offset > MAX_POINT_STEP {
            return Err(PcdError::MalformedHeader);
        }
    }

    Ok(PcdLayout {
        fields,
        point_step: offset,
        num_elements: element,
        num_points: points,
        viewpoint,
        encoding,
    })
}

fn read_binary_body<R: Read>(
    reader: &mut R,
    layout: &PcdLayout,
) -> Result<(Vec<[f64; 3]>, Vec<[u8; 3]>, Vec<[f64; 3]>), PcdError> {
    let fx = layout.field("x")?.offset;
    let fy = layout.field("y")?.offset;
    let fz = layout.field("z")?.offset;
    let frgb = layout.fields.get("rgb").map(|f| f.offset);
    let fnormals = layout.normal_fields().map(|f| [f[0].offset, f[1].offset, f[2].offset]);

    if layout.point_step == 0 {
        return Err(PcdError::MalformedHeader);
    }

    let mut buffer = vec![0u8; layout.point_step];
    let mut points = Vec::with_capacity(layout.num_points);
    let mut colors = Vec::new();
    let mut normals = Vec::new();

    for _ in 0..layout.num_points {
        reader.read_exact(&mut buffer)?;

        let x = read_f32(&buffer, fx)?;
        let y = read_f32(&buffer, fy)?;
        let z = read_f32(&buffer, fz)?;
        points.push([x as f64, y as f64, z as f64]);

        if let Some(off) = frgb {
            colors.push(unpack_rgb(read_u32(&buffer, off)?));
        }

        if let Some([ox, oy, oz]) = fnormals {
            normals.push([
                read_f32(&buffer, ox)? as f64,
                read_f32(&buffer, oy)? as f64,
                read_f32(&buffer, oz)? as f64,
            ]);
        }
    }

    Ok((points, colors, normals))
}

fn read_ascii_body<R: BufRead>(
    reader: &mut R,
    layout: &PcdLayout,
) -> Result<(Vec<[f64; 3]>, Vec<[u8; 3]>, Vec<[f64; 3]>), PcdError> {
    let ex = layout.field("x")?.element;
    let ey = layout.field("y")?.element;
    let ez = layout.field("z")?.element;
    let frgb = layout.fields.get("rgb");
    let fnormals = layout
        .normal_fields()
        .map(|f| [f[0].element, f[1].element, f[2].element]);

    let mut points = Vec::with_capacity(layout.num_points);
    let mut colors = Vec::new();
    let mut normals = Vec::new();

    let mut lines = reader.lines();
    for record in 0..layout.num_points {
        let line = lines.next().ok_or(PcdError::MalformedRecord(record))??;
        let tokens = line.split_whitespace().collect::<Vec<_>>();
        if tokens.len() != layout.num_elements {
            return Err(PcdError::MalformedRecord(record));
        }
        let value = |idx: usize| -> Result<f64, PcdError> {
            tokens[idx]
                .parse::<f64>()
                .map_err(|_| PcdError::MalformedRecord(record))
        };

        points.push([value(ex)?, value(ey)?, value(ez)?]);

        if let Some(field) = frgb {
            let token = tokens[field.element];
            let rgb = match field.kind {
                'F' => token
                    .parse::<f32>()
                    .map(f32::to_bits)
                    .map_err(|_| PcdError::MalformedRecord(record))?,
                _ => token
                    .parse::<u32>()
                    .map_err(|_| PcdError::MalformedRecord(record))?,
            };
            colors.push(unpack_rgb(rgb));
        }

        if let Some([nx, ny, nz]) = fnormals {
            normals.push([value(nx)?, value(ny)?, value(nz)?]);
        }
    }

    Ok((points, colors, normals))
}

/// Read a PCD file with an `ascii` or `binary` body.
///
/// # Arguments
/// * `path` - Path to a `.pcd` file.
///
/// # Returns
/// A [`PointCloud`] containing:
/// - 3D points (always)
/// - RGB colors (if present)
/// - Normals (if present)
/// - The sensor origin (if the `VIEWPOINT` translation is not zero)
pub fn read_pcd(path: impl AsRef<Path>) -> Result<PointCloud, PcdError> {
    let Some(file_ext) = path.as_ref().extension() else {
        return Err(PcdError::InvalidFileExtension("".into()));
    };

    if !file_ext.eq_ignore_ascii_case("pcd") {
        return Err(PcdError::InvalidFileExtension(
            file_ext.to_string_lossy().to_string(),
        ));
    }

    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);

    let layout = parse_pcd_layout(&mut reader)?;

    if layout.num_points > MAX_POINTS {
        return Err(PcdError::MalformedHeader);
    }

    let (points, colors, normals) = match layout.encoding {
        PcdEncoding::Binary => read_binary_body(&mut reader, &layout)?,
        PcdEncoding::Ascii => read_ascii_body(&mut reader, &layout)?,
    };

    let cloud = PointCloud::new(
        points,
        (!colors.is_empty()).then_some(colors),
        (!normals.is_empty()).then_some(normals),
    );

    Ok(match layout.viewpoint {
        Some(origin) => cloud.with_sensor_origin(origin),
        None => cloud,
    })
}

/// Write a point cloud as a binary PCD file.
///
/// Points and normals are stored as `f32`, colors as a packed `rgb` field.
/// The sensor origin, when present, is stored in the `VIEWPOINT` header.
pub fn write_pcd_binary(path: impl AsRef<Path>, cloud: &PointCloud) -> Result<(), PcdError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut fields = vec!["x", "y", "z"];
    if cloud.colors().is_some() {
        fields.push("rgb");
    }
    if cloud.normals().is_some() {
        fields.extend(["normal_x", "normal_y", "normal_z"]);
    }
    let types = fields
        .iter()
        .map(|f| if *f == "rgb" { "U" } else { "F" })
        .collect::<Vec<_>>();

    let [vx, vy, vz] = cloud.sensor_origin().unwrap_or([0.0; 3]);

    writeln!(writer, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(writer, "VERSION 0.7")?;
    writeln!(writer, "FIELDS {}", fields.join(" "))?;
    writeln!(writer, "SIZE {}", vec!["4"; fields.len()].join(" "))?;
    writeln!(writer, "TYPE {}", types.join(" "))?;
    writeln!(writer, "COUNT {}", vec!["1"; fields.len()].join(" "))?;
    writeln!(writer, "WIDTH {}", cloud.len())?;
    writeln!(writer, "HEIGHT 1")?;
    writeln!(writer, "VIEWPOINT {vx} {vy} {vz} 1 0 0 0")?;
    writeln!(writer, "POINTS {}", cloud.len())?;
    writeln!(writer, "DATA binary")?;

    for (i, p) in cloud.points().iter().enumerate() {
        for v in p {
            writer.write_all(&(*v as f32).to_le_bytes())?;
        }
        if let Some(colors) = cloud.colors() {
            let [r, g, b] = colors.get(i).copied().unwrap_or_default();
            let rgb = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
            writer.write_all(&rgb.to_le_bytes())?;
        }
        if let Some(normals) = cloud.normals() {
            for v in normals.get(i).copied().unwrap_or_default() {
                writer.write_all(&(v as f32).to_le_bytes())?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_ascii_header() {
        let data = b"FIELDS x y z
SIZE 4 4 4
TYPE F F F
COUNT 1 1 1
POINTS 1
DATA ascii";
        let mut reader = Cursor::new(&data[..]);
        let layout = parse_pcd_layout(&mut reader).expect("ascii header should parse");
        assert_eq!(layout.encoding, PcdEncoding::Ascii);
        assert_eq!(layout.num_elements, 3);
    }

    #[test]
    fn parses_valid_binary_header() {
        let data = b"# comment
FIELDS x y z
SIZE 4 4 4
TYPE F F F
COUNT 1 1 1
VIEWPOINT 0 0 2 1 0 0 0
POINTS 10
DATA binary";
        let mut reader = Cursor::new(&data[..]);
        let layout = parse_pcd_layout(&mut reader).expect("valid binary header should parse");
        assert_eq!(layout.num_points, 10);
        assert_eq!(layout.point_step, 12);
        assert_eq!(layout.viewpoint, Some([0.0, 0.0, 2.0]));
        assert!(layout.fields.contains_key("x"));
    }

    #[test]
    fn rejects_compressed_body() {
        let data = b"FIELDS x y z
SIZE 4 4 4
TYPE F F F
POINTS 1
DATA binary_compressed";
        let mut reader = Cursor::new(&data[..]);
        assert!(parse_pcd_layout(&mut reader).is_err());
    }

    #[test]
    fn rejects_wrong_type_for_xyz() {
        let data = b"FIELDS x y z
SIZE 4 4 4
TYPE I I I
COUNT 1 1 1
POINTS 5
DATA binary";
        let mut reader = Cursor::new(&data[..]);
        assert!(parse_pcd_layout(&mut reader).is_err());
    }

    #[test]
    fn reads_ascii_body() -> Result<(), Box<dyn std::error::Error>> {
        let data = b"FIELDS x y z rgb
SIZE 4 4 4 4
TYPE F F F U
COUNT 1 1 1 1
POINTS 2
DATA ascii
0.5 1 2 16711680
-1 0.25 3 255
";
        let mut reader = Cursor::new(&data[..]);
        let layout = parse_pcd_layout(&mut reader)?;
        let (points, colors, normals) = read_ascii_body(&mut reader, &layout)?;
        assert_eq!(points, vec![[0.5, 1.0, 2.0], [-1.0, 0.25, 3.0]]);
        assert_eq!(colors, vec![[255, 0, 0], [0, 0, 255]]);
        assert!(normals.is_empty());
        Ok(())
    }

    #[test]
    fn ascii_body_with_missing_tokens_fails() -> Result<(), Box<dyn std::error::Error>> {
        let data = b"FIELDS x y z
SIZE 4 4 4
TYPE F F F
POINTS 1
DATA ascii
0.5 1
";
        let mut reader = Cursor::new(&data[..]);
        let layout = parse_pcd_layout(&mut reader)?;
        let res = read_ascii_body(&mut reader, &layout);
        assert!(matches!(res, Err(PcdError::MalformedRecord(0))));
        Ok(())
    }

    #[test]
    fn write_then_read_binary() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mug_30_60.pcd");

        let cloud = PointCloud::new(
            vec![[0.0, 0.5, 1.0], [0.25, -0.5, 2.0]],
            Some(vec![[10, 20, 30], [40, 50, 60]]),
            Some(vec![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]),
        )
        .with_sensor_origin([0.0, 0.0, 1.5]);
        write_pcd_binary(&path, &cloud)?;

        let read = read_pcd(&path)?;
        assert_eq!(read, cloud);
        Ok(())
    }

    #[test]
    fn reads_uppercase_extension() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mug_0_0.PCD");
        let cloud = PointCloud::new(vec![[1.0, 2.0, 3.0]], None, None);
        write_pcd_binary(&path, &cloud)?;
        assert_eq!(read_pcd(&path)?, cloud);
        Ok(())
    }

    #[test]
    fn write_then_read_empty_cloud() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty_0_0.pcd");
        write_pcd_binary(&path, &PointCloud::new(vec![], None, None))?;

        let read = read_pcd(&path)?;
        assert!(read.is_empty());
        assert_eq!(read.sensor_origin(), None);
        Ok(())
    }

    #[test]
    fn rejects_other_extensions() {
        let res = read_pcd("cloud.ply");
        assert!(matches!(res, Err(PcdError::InvalidFileExtension(ext)) if ext == "ply"));
    }
}
