//! Box-drawn rendering of the synthesizer's comparison table

use unicode_width::UnicodeWidthStr;

use crate::core::synthesis::SummaryTable;

/// Render `table` as lines of box-drawing text. Cells wider than
/// `max_cell_width` columns are clipped; short rows are padded.
pub fn render_table(table: &SummaryTable, max_cell_width: usize) -> Vec<String> {
    let columns = table
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(table.headers.len()))
        .max()
        .unwrap_or(0);
    if columns == 0 {
        return Vec::new();
    }

    let mut col_widths = vec![0; columns];
    for row in std::iter::once(&table.headers).chain(table.rows.iter()) {
        for (i, cell) in row.iter().enumerate() {
            let width = UnicodeWidthStr::width(cell.as_str()).min(max_cell_width);
            col_widths[i] = col_widths[i].max(width);
        }
    }

    let mut lines = vec![border_line("┌", "┐", "┬", &col_widths)];
    lines.push(content_line(&table.headers, &col_widths));
    lines.push(border_line("├", "┤", "┼", &col_widths));
    for row in &table.rows {
        lines.push(content_line(row, &col_widths));
    }
    lines.push(border_line("└", "┘", "┴", &col_widths));
    lines
}

fn border_line(left: &str, right: &str, mid: &str, col_widths: &[usize]) -> String {
    let mut line = String::from(left);
    for (i, &width) in col_widths.iter().enumerate() {
        line.push_str(&"─".repeat(width + 2));
        if i < col_widths.len() - 1 {
            line.push_str(mid);
        }
    }
    line.push_str(right);
    line
}

fn content_line(row: &[String], col_widths: &[usize]) -> String {
    let mut line = String::from("│");
    for (i, &width) in col_widths.iter().enumerate() {
        let cell = row.get(i).map(String::as_str).unwrap_or("");
        let clipped = clip_text_to_width(cell, width);
        let used = UnicodeWidthStr::width(clipped.as_str());
        line.push(' ');
        line.push_str(&clipped);
        line.push_str(&" ".repeat(width - used));
        line.push_str(" │");
    }
    line
}

fn clip_text_to_width(text: &str, max_width: usize) -> String {
    let mut result = String::new();
    let mut current_width = 0;

    for ch in text.chars() {
        let ch_width = UnicodeWidthStr::width(ch.encode_utf8(&mut [0; 4]));
        if current_width + ch_width > max_width {
            break;
        }
        result.push(ch);
        current_width += ch_width;
    }

    result
}
