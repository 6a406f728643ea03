//! Monitoring for the classification pipeline: lifetime counters, the most
//! recent cycle summary, and the formatted status table logged on a timer.

mod cycle_tracker;

pub use cycle_tracker::CycleTracker;

/// Render a markdown-style table with padded columns.
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.len())
                .max()
                .unwrap_or(0)
                .max(h.len())
        })
        .collect();

    let pad_row = |cells: &[String]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[i]))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };

    let mut output = pad_row(&headers.iter().map(|h| h.to_string()).collect::<Vec<_>>());
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&format!("|-{}-|\n", separator.join("-|-")));
    for row in rows {
        output.push_str(&pad_row(row));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table_pads_columns() {
        let table = format_table(
            &["State", "Count"],
            &[
                vec!["pending".to_string(), "3".to_string()],
                vec!["classified".to_string(), "120".to_string()],
            ],
        );
        assert!(table.starts_with("| State"));
        assert!(table.contains("| pending"));
        // Every line has the same width.
        let widths: Vec<usize> = table.lines().map(|l| l.len()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_format_table_empty_rows_is_empty() {
        assert_eq!(format_table(&["A"], &[]), String::new());
    }
}
