//! Writers for exposure results.
//!
//! Exposures can be written as CSV (`x,y,weight`, preceded by `%`-prefixed
//! metadata lines) or as a little-endian binary file. Principal axes have
//! their own small CSV layout.

use crate::pca::PrincipalAxes;
use crate::shutter::ComputeOutput;
use crate::types::Resolution;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Magic bytes at the start of a binary exposure file.
pub const BINARY_MAGIC: &[u8; 8] = b"DCEOUT\0\0";
pub const BINARY_VERSION: u32 = 1;

/// Points decoded per read while loading a binary exposure.
const READ_CHUNK_POINTS: usize = 1 << 16;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// On-disk layout of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Binary,
}

impl OutputFormat {
    /// Picks the format from a file extension; anything but `.bin` is CSV.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("bin") => Self::Binary,
            _ => Self::Csv,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "bin" | "binary" => Ok(Self::Binary),
            other => Err(OutputError::InvalidFormat(format!(
                "Unknown output format: {}. Use csv or bin",
                other
            ))),
        }
    }
}

/// CSV writer for exposure points.
pub struct CsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes geometry and running-sum metadata.
    pub fn write_header(
        &mut self,
        resolution: Option<Resolution>,
        output: &ComputeOutput,
    ) -> Result<(), OutputError> {
        if let Some(res) = resolution {
            writeln!(self.writer, "%geometry:{},{}", res.width, res.height)?;
        }
        writeln!(self.writer, "%count:{}", output.count)?;
        writeln!(self.writer, "%sum:{},{}", output.sum_x, output.sum_y)?;
        writeln!(self.writer, "x,y,weight")?;
        Ok(())
    }

    pub fn write_points(&mut self, points: &[[f32; 3]]) -> Result<(), OutputError> {
        for [x, y, w] in points {
            writeln!(self.writer, "{},{},{}", x, y, w)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Binary exposure writer.
///
/// Header: 8 magic bytes, version (u32), width and height (u32), point
/// count (u64), sum_x and sum_y (f32). Then `count` packed `(x, y, weight)`
/// f32 triples. All little-endian.
pub struct BinaryWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(
        &mut self,
        resolution: Resolution,
        output: &ComputeOutput,
    ) -> Result<(), OutputError> {
        self.writer.write_all(BINARY_MAGIC)?;
        self.writer.write_u32::<LittleEndian>(BINARY_VERSION)?;
        self.writer.write_u32::<LittleEndian>(resolution.width)?;
        self.writer.write_u32::<LittleEndian>(resolution.height)?;
        self.writer
            .write_u64::<LittleEndian>(output.points.len() as u64)?;
        self.writer.write_f32::<LittleEndian>(output.sum_x)?;
        self.writer.write_f32::<LittleEndian>(output.sum_y)?;
        Ok(())
    }

    pub fn write_points(&mut self, points: &[[f32; 3]]) -> Result<(), OutputError> {
        for value in points.iter().flatten() {
            self.writer.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads a binary exposure back.
pub fn read_binary<R: Read>(mut reader: R) -> Result<(Resolution, ComputeOutput), OutputError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != BINARY_MAGIC {
        return Err(OutputError::InvalidFormat("not a DCE exposure file".to_string()));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != BINARY_VERSION {
        return Err(OutputError::InvalidFormat(format!(
            "unsupported exposure file version {}",
            version
        )));
    }
    let resolution = Resolution {
        width: reader.read_u32::<LittleEndian>()?,
        height: reader.read_u32::<LittleEndian>()?,
    };
    let count = reader.read_u64::<LittleEndian>()?;
    let sum_x = reader.read_f32::<LittleEndian>()?;
    let sum_y = reader.read_f32::<LittleEndian>()?;

    let count = u32::try_from(count)
        .map_err(|_| OutputError::InvalidFormat(format!("point count {} too large", count)))?;

    // The header count is untrusted; grow with the data actually present.
    let mut points = Vec::with_capacity((count as usize).min(READ_CHUNK_POINTS));
    let mut flat = vec![0f32; (count as usize).min(READ_CHUNK_POINTS) * 3];
    let mut remaining = count as usize;
    while remaining > 0 {
        let n = remaining.min(READ_CHUNK_POINTS);
        let chunk = &mut flat[..n * 3];
        reader
            .read_f32_into::<LittleEndian>(chunk)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => OutputError::InvalidFormat(format!(
                    "header declares {} points but the data ends after {}",
                    count,
                    points.len()
                )),
                _ => OutputError::Io(err),
            })?;
        points.extend(chunk.chunks_exact(3).map(|p| [p[0], p[1], p[2]]));
        remaining -= n;
    }

    Ok((
        resolution,
        ComputeOutput {
            points,
            count,
            sum_x,
            sum_y,
        },
    ))
}

/// Writes an exposure to `path` in `format`.
pub fn write_output<P: AsRef<Path>>(
    path: P,
    output: &ComputeOutput,
    resolution: Resolution,
    format: OutputFormat,
) -> Result<(), OutputError> {
    let file = File::create(path)?;
    match format {
        OutputFormat::Csv => {
            let mut writer = CsvWriter::new(file);
            writer.write_header(Some(resolution), output)?;
            writer.write_points(&output.points)?;
            writer.flush()
        }
        OutputFormat::Binary => {
            let mut writer = BinaryWriter::new(file);
            writer.write_header(resolution, output)?;
            writer.write_points(&output.points)?;
            writer.flush()
        }
    }
}

/// Reads a binary exposure file.
pub fn read_binary_file<P: AsRef<Path>>(path: P) -> Result<(Resolution, ComputeOutput), OutputError> {
    read_binary(BufReader::new(File::open(path)?))
}

/// Writes principal axes as `axis,eigenvalue,dx,dy` rows after a mean line.
pub fn write_pca_csv<W: Write>(writer: W, axes: &PrincipalAxes) -> Result<(), OutputError> {
    let mut writer = BufWriter::new(writer);
    writeln!(writer, "%mean:{},{}", axes.mean[0], axes.mean[1])?;
    writeln!(writer, "axis,eigenvalue,dx,dy")?;
    for (i, (lambda, axis)) in axes.eigenvalues.iter().zip(&axes.axes).enumerate() {
        writeln!(writer, "{},{},{},{}", i, lambda, axis[0], axis[1])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca::Covariance;
    use std::io::Cursor;

    fn output() -> ComputeOutput {
        ComputeOutput {
            points: vec![[1.0, 2.0, 0.5], [3.0, 4.0, -0.25]],
            count: 2,
            sum_x: 4.0,
            sum_y: 6.0,
        }
    }

    #[test]
    fn test_csv_writer() {
        let mut buf = Vec::new();
        {
            let out = output();
            let mut writer = CsvWriter::new(&mut buf);
            writer
                .write_header(Some(Resolution { width: 640, height: 480 }), &out)
                .unwrap();
            writer.write_points(&out.points).unwrap();
            writer.flush().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("%geometry:640,480\n%count:2\n%sum:4,6\n"));
        assert!(text.contains("1,2,0.5\n"));
        assert!(text.contains("3,4,-0.25\n"));
    }

    #[test]
    fn test_binary_layout() {
        let mut buf = Vec::new();
        {
            let out = output();
            let mut writer = BinaryWriter::new(&mut buf);
            writer.write_header(Resolution::default(), &out).unwrap();
            writer.write_points(&out.points).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(&buf[..8], BINARY_MAGIC);
        assert_eq!(buf.len(), 8 + 4 + 8 + 8 + 8 + 2 * 12);

        let (res, back) = read_binary(Cursor::new(buf)).unwrap();
        assert_eq!(res, Resolution::default());
        assert_eq!(back, output());
    }

    #[test]
    fn test_read_binary_rejects_bad_magic() {
        let err = read_binary(Cursor::new(b"EVT3BIN\0".to_vec())).unwrap_err();
        assert!(matches!(err, OutputError::InvalidFormat(_)));
    }

    fn header(count: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(BINARY_MAGIC);
        buf.write_u32::<LittleEndian>(BINARY_VERSION).unwrap();
        buf.write_u32::<LittleEndian>(640).unwrap();
        buf.write_u32::<LittleEndian>(480).unwrap();
        buf.write_u64::<LittleEndian>(count).unwrap();
        buf.write_f32::<LittleEndian>(0.0).unwrap();
        buf.write_f32::<LittleEndian>(0.0).unwrap();
        buf
    }

    #[test]
    fn test_read_binary_rejects_oversized_count() {
        let err = read_binary(Cursor::new(header(u32::MAX as u64))).unwrap_err();
        assert!(matches!(err, OutputError::InvalidFormat(_)));

        let err = read_binary(Cursor::new(header(u64::MAX))).unwrap_err();
        assert!(matches!(err, OutputError::InvalidFormat(_)));
    }

    #[test]
    fn test_read_binary_rejects_truncated_points() {
        let mut buf = header(3);
        for value in [1.0f32, 2.0, 0.5, 3.0, 4.0] {
            buf.write_f32::<LittleEndian>(value).unwrap();
        }
        let err = read_binary(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, OutputError::InvalidFormat(_)));
    }

    #[test]
    fn test_output_format_selection() {
        assert_eq!(OutputFormat::from_path("frame.BIN"), OutputFormat::Binary);
        assert_eq!(OutputFormat::from_path("frame.csv"), OutputFormat::Csv);
        assert_eq!("binary".parse::<OutputFormat>().unwrap(), OutputFormat::Binary);
        assert!("arrow".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_pca_csv() {
        let axes = PrincipalAxes {
            mean: [1.5, 2.0],
            covariance: Covariance::default(),
            eigenvalues: [4.0, 1.0],
            axes: [[2.0, 0.0], [0.0, 1.0]],
        };
        let mut buf = Vec::new();
        write_pca_csv(&mut buf, &axes).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "%mean:1.5,2\naxis,eigenvalue,dx,dy\n0,4,2,0\n1,1,0,1\n"
        );
    }
}
