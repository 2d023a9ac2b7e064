//! Parsing of record inventories printed by the record-matching tool.
//!
//! Each inventory line looks like `12:40593:d=2024120712:UGRD:200 mb:6 hour fcst:`,
//! i.e. the record index, the byte offset, then the fields that identify the
//! record. Some sources repeat a record under a different index, so records
//! are de-duplicated on the identifying fields only.
use itertools::Itertools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRecord {
    pub index: String,
    pub identity: Vec<String>,
    pub line: String,
}

impl MatchedRecord {
    fn from_line(line: &str) -> Self {
        let fields = line.split(':').collect_vec();
        Self {
            index: fields[0].to_string(),
            identity: fields.iter().skip(2).map(|s| s.to_string()).collect(),
            line: line.to_string(),
        }
    }
}

/// Turn the tool output into records, dropping empty and warning lines.
pub fn parse_match_output(output: &str) -> Vec<MatchedRecord> {
    output
        .lines()
        .map(|l| l.trim_end())
        .filter(|l| !l.is_empty() && !l.starts_with("Warning:"))
        .map(MatchedRecord::from_line)
        .collect()
}

/// Remove records whose identity appears again later in the list. The last
/// occurrence of each duplicate is kept.
pub fn unique_records(records: Vec<MatchedRecord>) -> Vec<MatchedRecord> {
    let keep = records
        .iter()
        .enumerate()
        .map(|(i, r)| !records[i + 1..].iter().any(|later| later.identity == r.identity))
        .collect_vec();
    records
        .into_iter()
        .zip(keep)
        .filter_map(|(r, k)| k.then_some(r))
        .collect()
}

/// The expression selecting any of `patterns`, e.g. `(:UGRD:200 mb:|:UGRD:850 mb:)`.
pub fn match_expression<S: AsRef<str>>(patterns: &[S]) -> String {
    format!("({})", patterns.iter().map(|p| p.as_ref()).join("|"))
}

/// The expression selecting records by index, e.g. `^(1:|5:)`.
pub fn index_selector(records: &[MatchedRecord]) -> String {
    format!("^({})", records.iter().map(|r| format!("{}:", r.index)).join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = "\
Warning: ignoring unknown local table
1:0:d=2024120712:APCP:surface:0-6 hour acc fcst:

7:90210:d=2024120712:UGRD:200 mb:6 hour fcst:
9:100234:d=2024120712:APCP:surface:0-6 hour acc fcst:
";

    #[test]
    fn test_parse_and_dedup() {
        let records = parse_match_output(INVENTORY);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].index, "7");
        assert_eq!(records[1].identity, vec!["d=2024120712", "UGRD", "200 mb", "6 hour fcst", ""]);

        let unique = unique_records(records);
        assert_eq!(unique.iter().map(|r| r.index.as_str()).collect_vec(), vec!["7", "9"]);
        assert_eq!(index_selector(&unique), "^(7:|9:)");
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_match_output("\n\nWarning: nothing\n").is_empty());
        assert!(unique_records(vec![]).is_empty());
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(match_expression(&[":UGRD:200 mb:", ":UGRD:850 mb:"]), "(:UGRD:200 mb:|:UGRD:850 mb:)");
    }
}
