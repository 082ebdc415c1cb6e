//! Result file persistence.
//!
//! One region per line: `frameId,x,y,w,h,label,confidence,resolution,origin`.
//! A file name ending in `.csv` selects CSV quoting with `\r\n` terminators;
//! anything else is the bare comma-joined text form. Loading drops gap-filling
//! placeholders.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use super::ResultSet;
use crate::region::{Region, GENERIC_ORIGIN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultFormat {
    Text,
    Csv,
}

impl ResultFormat {
    /// Chooses the format purely from the file name suffix.
    pub fn from_path(path: &Path) -> Self {
        let is_csv = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".csv"));
        if is_csv {
            ResultFormat::Csv
        } else {
            ResultFormat::Text
        }
    }
}

/// Shortest round-trip float text: integral values keep a `.0`, exponents
/// carry a sign and at least two digits (`1e-05`, `1e+16`).
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let repr = format!("{:?}", value);
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => repr,
    }
}

fn fields_of(region: &Region) -> [String; 9] {
    [
        region.frame_id.to_string(),
        format_float(region.x),
        format_float(region.y),
        format_float(region.w),
        format_float(region.h),
        region.label.clone(),
        format_float(region.confidence),
        format_float(region.resolution),
        region.origin.clone(),
    ]
}

pub(crate) fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

impl ResultSet {
    /// Renders every region in `format`.
    pub fn render(&self, format: ResultFormat) -> String {
        let mut out = String::new();
        for region in self.iter() {
            let fields = fields_of(region);
            match format {
                ResultFormat::Text => {
                    out.push_str(&fields.join(","));
                    out.push('\n');
                }
                ResultFormat::Csv => {
                    let quoted: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
                    out.push_str(&quoted.join(","));
                    out.push_str("\r\n");
                }
            }
        }
        out
    }

    /// Writes the result file, format chosen by file name.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.render(ResultFormat::from_path(path)))
            .with_context(|| format!("failed to write results to {}", path.display()))
    }

    /// Loads a result file, format chosen by file name. Placeholder rows are skipped.
    pub fn read(path: impl AsRef<Path>) -> Result<ResultSet> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read results from {}", path.display()))?;
        Self::parse(&raw, ResultFormat::from_path(path))
            .with_context(|| format!("invalid result file {}", path.display()))
    }

    pub fn parse(content: &str, format: ResultFormat) -> Result<ResultSet> {
        let rows = match format {
            ResultFormat::Text => split_text_rows(content),
            ResultFormat::Csv => split_csv_rows(content)?,
        };
        let mut results = ResultSet::new();
        for (line, fields) in rows {
            let region = parse_row(&fields).with_context(|| format!("line {}", line))?;
            if !region.is_placeholder() {
                results.append(region);
            }
        }
        Ok(results)
    }
}

fn split_text_rows(content: &str) -> Vec<(usize, Vec<String>)> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, line.split(',').map(str::to_string).collect()))
        .collect()
}

/// Minimal CSV reader: quoted fields, doubled quotes, `\n` or `\r\n` records.
fn split_csv_rows(content: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut rows = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut row_line = 1;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    rows.push((row_line, std::mem::take(&mut fields)));
                }
                fields.clear();
                line += 1;
                row_line = line;
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        bail!("line {}: unterminated quoted field", row_line);
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        rows.push((row_line, fields));
    }
    Ok(rows)
}

fn parse_row(fields: &[String]) -> Result<Region> {
    if fields.len() != 8 && fields.len() != 9 {
        bail!("expected 8 or 9 fields, found {}", fields.len());
    }
    let frame_id: u32 = fields[0]
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid frame id '{}'", fields[0]))?;
    let number = |idx: usize, name: &str| -> Result<f64> {
        fields[idx]
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid {} '{}'", name, fields[idx]))
    };
    let origin = fields
        .get(8)
        .map(|o| o.trim().to_string())
        .unwrap_or_else(|| GENERIC_ORIGIN.to_string());
    Ok(Region::new(
        frame_id,
        number(1, "x")?,
        number(2, "y")?,
        number(3, "w")?,
        number(4, "h")?,
        number(6, "confidence")?,
        fields[5].clone(),
        number(7, "resolution")?,
        origin,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_column_is_trimmed_on_both_sides() {
        let parsed = ResultSet::parse(
            "4,0.1,0.1,0.2,0.2,vehicle,0.8,1.0,  high \r\n5,0.1,0.1,0.2,0.2,vehicle,0.8,1.0,\tlow\n",
            ResultFormat::Text,
        )
        .expect("parse");
        let origins: Vec<&str> = parsed.iter().map(|r| r.origin.as_str()).collect();
        assert_eq!(origins, vec!["high", "low"]);
    }

    #[test]
    fn floats_match_python_repr() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.0), "0.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(0.35000000000000003), "0.35000000000000003");
        assert_eq!(format_float(1e-5), "1e-05");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(123.25), "123.25");
    }

    #[test]
    fn format_is_chosen_by_suffix() {
        assert_eq!(ResultFormat::from_path(Path::new("out/video.csv")), ResultFormat::Csv);
        assert_eq!(ResultFormat::from_path(Path::new("video")), ResultFormat::Text);
        assert_eq!(ResultFormat::from_path(Path::new("video.csv.txt")), ResultFormat::Text);
    }

    #[test]
    fn text_rows_are_bare() {
        let mut results = ResultSet::new();
        results.append(Region::new(4, 0.1, 0.2, 0.3, 0.4, 0.9, "car", 0.8, "low"));
        assert_eq!(
            results.render(ResultFormat::Text),
            "4,0.1,0.2,0.3,0.4,car,0.9,0.8,low\n"
        );
    }

    #[test]
    fn csv_rows_quote_when_needed() {
        let mut results = ResultSet::new();
        results.append(Region::new(0, 0.0, 0.0, 0.0, 0.0, 0.1, "no obj", 1.0, "generic"));
        results.append(Region::new(1, 0.5, 0.5, 0.1, 0.1, 0.7, "truck, \"big\"", 1.0, "high"));
        assert_eq!(
            results.render(ResultFormat::Csv),
            "0,0.0,0.0,0.0,0.0,no obj,0.1,1.0,generic\r\n\
             1,0.5,0.5,0.1,0.1,\"truck, \"\"big\"\"\",0.7,1.0,high\r\n"
        );
    }

    #[test]
    fn csv_parse_reads_quoted_fields() {
        let content = "1,0.5,0.5,0.1,0.1,\"truck, \"\"big\"\"\",0.7,1.0,high\r\n";
        let results = ResultSet::parse(content, ResultFormat::Csv).expect("parse");
        assert_eq!(results.len(), 1);
        assert_eq!(results.regions()[0].label, "truck, \"big\"");
        assert_eq!(results.regions()[0].origin, "high");
    }

    #[test]
    fn text_parse_defaults_origin_and_skips_placeholders() {
        let content = "0,0,0,0,0,no obj,0.1,1.0\n2,0.1,0.1,0.2,0.2,car,0.8,0.8\n3,0.1,0.1,0.2,0.2,car,0.8,0.8,high \n";
        let results = ResultSet::parse(content, ResultFormat::Text).expect("parse");
        assert_eq!(results.len(), 2);
        assert_eq!(results.regions()[0].origin, GENERIC_ORIGIN);
        assert_eq!(results.regions()[1].origin, "high");
    }

    #[test]
    fn malformed_rows_are_fatal() {
        let err = ResultSet::parse("0,0.1,0.1,0.2\n", ResultFormat::Text).unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));

        let err = ResultSet::parse("x,0.1,0.1,0.2,0.2,car,0.8,0.8,low\n", ResultFormat::Text)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("invalid frame id"));

        assert!(ResultSet::parse("1,\"open", ResultFormat::Csv).is_err());
    }

    #[test]
    fn text_round_trip_preserves_regions() {
        let mut results = ResultSet::new();
        results.append(Region::new(0, 0.1, 0.1, 0.25, 0.2, 0.9, "car", 0.8, "low"));
        results.append(Region::new(0, 0.55, 0.6, 0.1, 0.3, 0.45, "person", 1.0, "high"));
        results.append(Region::new(2, 1.0 / 3.0, 0.0, 0.5, 0.5, 1e-5, "car", 1.0, "tracking"));
        results.fill_gaps(3);

        let reloaded = ResultSet::parse(&results.render(ResultFormat::Text), ResultFormat::Text)
            .expect("parse");
        assert_eq!(reloaded, results.without_placeholders());
    }
}
