use crate::fleet::FleetEntry;
use std::fmt::Write;

const HEADER: [&str; 5] = ["DEVICE", "NAME", "IP", "TTL", "STATUS"];

/// Fixed-width text table of the fleet
pub fn render_table(entries: &[FleetEntry]) -> String {
    let rows: Vec<[String; 5]> = entries
        .iter()
        .map(|e| {
            [
                e.device_id.clone(),
                e.name.clone(),
                e.ip.clone(),
                e.ttl_remaining.to_string(),
                if e.online { "online" } else { "offline" }.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &HEADER.map(String::from), &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(rule.join("  ").as_str());
    out.push('\n');
    for row in &rows {
        push_row(&mut out, row, &widths);
    }
    if rows.is_empty() {
        out.push_str("(no devices seen yet)\n");
    }
    out
}

fn push_row(out: &mut String, cells: &[String; 5], widths: &[usize; 5]) {
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        let _ = write!(line, "{cell:<width$}");
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str, ttl: u64, online: bool) -> FleetEntry {
        FleetEntry {
            device_id: id.into(),
            name: name.into(),
            ip: "10.0.0.1".into(),
            ttl_remaining: ttl,
            online,
            last_heartbeat: 0.0,
        }
    }

    #[test]
    fn test_columns_are_aligned() {
        let table = render_table(&[entry("dev-1", "north-cam", 10, true), entry("d2", "x", 0, false)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("DEVICE  NAME       IP"));
        assert!(lines[2].starts_with("dev-1   north-cam  10.0.0.1  10   online"));
        assert!(lines[3].ends_with("0    offline"));
    }

    #[test]
    fn test_empty_fleet() {
        let table = render_table(&[]);
        assert!(table.ends_with("(no devices seen yet)\n"));
    }
}
