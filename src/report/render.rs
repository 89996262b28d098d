//! The one place that emits `|` rows.
//!
//! Consumers split report lines on `|`, skip any line containing `---`, skip
//! the row whose first cell is `Metric`, and read every other row as
//! key/value cells. So: every table header starts with `Metric`, cells never
//! contain `|`, `---` or a newline, and no cell is left empty.

pub const HEADER_LABEL: &str = "Metric";
const EMPTY_CELL: &str = "-";

/// Makes arbitrary text safe to place inside a table cell.
pub fn cell(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut dashes = 0;
    for c in value.chars() {
        let c = match c {
            '|' => '/',
            '\n' | '\r' | '\t' => ' ',
            c => c,
        };
        if c == '-' {
            dashes += 1;
            if dashes > 2 {
                continue;
            }
        } else {
            dashes = 0;
        }
        out.push(c);
    }

    let trimmed = out.trim();
    if trimmed.is_empty() {
        EMPTY_CELL.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn heading(out: &mut String, level: usize, title: &str) {
    out.push_str(&"#".repeat(level.max(1)));
    out.push(' ');
    out.push_str(&cell(title));
    out.push_str("\n\n");
}

fn row<S: AsRef<str>>(out: &mut String, cells: &[S]) {
    out.push('|');
    for value in cells {
        out.push(' ');
        out.push_str(&cell(value.as_ref()));
        out.push_str(" |");
    }
    out.push('\n');
}

fn header(out: &mut String, columns: &[&str]) {
    let mut cells = Vec::with_capacity(columns.len() + 1);
    cells.push(HEADER_LABEL);
    cells.extend_from_slice(columns);
    row(out, &cells);

    out.push('|');
    for _ in 0..cells.len() {
        out.push_str("---|");
    }
    out.push('\n');
}

/// `| Metric | Value |` table over label/value pairs.
pub fn metric_table<L, V>(out: &mut String, rows: &[(L, V)])
where
    L: AsRef<str>,
    V: AsRef<str>,
{
    header(out, &["Value"]);
    for (label, value) in rows {
        row(out, &[label.as_ref(), value.as_ref()]);
    }
    out.push('\n');
}

/// Table whose rows are already ranked. Each row starts with its label cell,
/// followed by one cell per entry in `columns`.
pub fn ranked_table(out: &mut String, columns: &[&str], rows: &[Vec<String>]) {
    header(out, columns);
    for cells in rows {
        row(out, cells);
    }
    out.push('\n');
}

pub fn seconds(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{}{}.{:06}", sign, abs / 1_000_000, abs % 1_000_000)
}

pub fn rate(amount: u64, micros: i64) -> String {
    if micros <= 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", amount as f64 * 1_000_000.0 / micros as f64)
}

pub fn average(total: u64, count: u64) -> String {
    if count == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", total as f64 / count as f64)
}

pub fn percent(part: u64, whole: u64) -> String {
    if whole == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", part as f64 * 100.0 / whole as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_never_carry_pipes_or_separators() {
        assert_eq!(cell("a|b"), "a/b");
        assert_eq!(cell("trace---final.pcap"), "trace--final.pcap");
        assert_eq!(cell("line\nbreak"), "line break");
        assert_eq!(cell("   "), "-");
    }

    #[test]
    fn metric_table_layout() {
        let mut out = String::new();
        metric_table(&mut out, &[("Total Packets", "3"), ("Odd|Key", "")]);
        assert_eq!(
            out,
            "| Metric | Value |\n|---|---|\n| Total Packets | 3 |\n| Odd/Key | - |\n\n"
        );
    }

    #[test]
    fn ranked_table_header_starts_with_metric() {
        let mut out = String::new();
        ranked_table(
            &mut out,
            &["Endpoints", "Packets"],
            &[vec!["Conversation 1".into(), "a <-> b".into(), "4".into()]],
        );
        let first = out.lines().next().unwrap();
        assert_eq!(first, "| Metric | Endpoints | Packets |");
        assert!(out.lines().nth(1).unwrap().contains("---"));
    }

    #[test]
    fn number_formats_are_fixed() {
        assert_eq!(seconds(0), "0.000000");
        assert_eq!(seconds(2_000_500), "2.000500");
        assert_eq!(seconds(-1_500_000), "-1.500000");
        assert_eq!(rate(300, 2_000_000), "150.00");
        assert_eq!(rate(300, 0), "0.00");
        assert_eq!(percent(1, 3), "33.33%");
        assert_eq!(percent(0, 0), "0.00%");
    }
}
