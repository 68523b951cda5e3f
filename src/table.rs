use std::collections::HashMap;

use csv::{ReaderBuilder, Trim};

/// One CSV row keyed by trimmed header token.
pub type Record = HashMap<String, String>;

/// Decode the upstream CSV dialect: UTF-8, header line, `,` separator, `"`
/// quoting. Rows shorter than the header are padded with empty strings and
/// extra columns are dropped; blank and whitespace-only lines are skipped.
/// No type coercion happens here.
pub fn parse(text: &str) -> Vec<Record> {
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match rdr.headers() {
        Ok(h) => h.iter().map(str::to_string).collect(),
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for rec in rdr.records() {
        let Ok(rec) = rec else { continue };
        if rec.iter().all(str::is_empty) {
            continue;
        }
        let mut row = Record::with_capacity(headers.len());
        for (i, key) in headers.iter().enumerate() {
            row.insert(key.clone(), rec.get(i).unwrap_or("").to_string());
        }
        out.push(row);
    }
    out
}

/// Mandatory price column: unparseable values become 0.0 rather than
/// dropping the row.
pub fn parse_price(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

/// Optional real columns: empty or unparseable values are absent.
pub fn parse_opt_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() { None } else { s.parse().ok() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_quoted_fields() {
        let rows = parse("name,brand\n\"Mlijeko, trajno\",Dukat\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Mlijeko, trajno");
        assert_eq!(rows[0]["brand"], "Dukat");
    }

    #[test]
    fn trims_headers_and_fields() {
        let rows = parse(" name , city \n Kruh , Zagreb \n");
        assert_eq!(rows[0]["name"], "Kruh");
        assert_eq!(rows[0]["city"], "Zagreb");
    }

    #[test]
    fn short_rows_pad_with_empty_strings() {
        let rows = parse("a,b,c\n1,2\n");
        assert_eq!(rows[0]["a"], "1");
        assert_eq!(rows[0]["b"], "2");
        assert_eq!(rows[0]["c"], "");
    }

    #[test]
    fn extra_columns_are_ignored() {
        let rows = parse("a,b\n1,2,3,4\n");
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0]["b"], "2");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let rows = parse("a,b\n1,2\n\n   \n3,4\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], "3");
    }

    #[test]
    fn empty_input_yields_no_records() {
        assert!(parse("").is_empty());
        assert!(parse("a,b\n").is_empty());
    }

    #[test]
    fn price_coercion() {
        assert_eq!(parse_price("1.29"), 1.29);
        assert_eq!(parse_price("n/a"), 0.0);
        assert_eq!(parse_price(""), 0.0);
        assert_eq!(parse_opt_price("2.5"), Some(2.5));
        assert_eq!(parse_opt_price(""), None);
        assert_eq!(parse_opt_price("x"), None);
    }
}
