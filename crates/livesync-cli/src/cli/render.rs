use std::fmt::Write;

use anyhow::{Context, Result};
use livesync_core::store::{ViewItem, ViewNode};

use super::replay::ReplayReport;

pub fn render_json(report: &ReplayReport, pretty: bool) -> Result<String> {
    if pretty {
        serde_json::to_string_pretty(report).context("Failed to serialize report")
    } else {
        serde_json::to_string(report).context("Failed to serialize report")
    }
}

/// One line per entity; replies are indented under their parent.
pub fn render_text(report: &ReplayReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", report.scope);
    for item in &report.items {
        let _ = writeln!(out, "{}", item_line(item));
    }
    for node in &report.nodes {
        node_lines(&mut out, node, 0);
    }
    if report.items.is_empty() && report.nodes.is_empty() {
        let _ = writeln!(out, "(empty)");
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "! {}", warning);
    }
    out
}

fn node_lines(out: &mut String, node: &ViewNode, depth: usize) {
    let marker = match (node.expanded, node.has_more_replies) {
        (true, true) => " [more replies]",
        _ => "",
    };
    let _ = writeln!(out, "{}{}{}", "  ".repeat(depth), item_line(&node.item), marker);
    for child in &node.children {
        node_lines(out, child, depth + 1);
    }
}

fn item_line(item: &ViewItem) -> String {
    let entity = &item.entity;
    let author = entity.payload.author_id.as_deref().unwrap_or("?");
    let mut line = format!("[{}] {}: {}", entity.sequence_key.0, author, entity.text());

    if let Some(counts) = &entity.payload.reaction_counts {
        let reactions: Vec<String> = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(reaction, count)| format!("{} {}", reaction, count))
            .collect();
        if !reactions.is_empty() {
            let _ = write!(line, " ({})", reactions.join(", "));
        }
    }
    for (flag, label) in [
        (item.is_own, "own"),
        (item.is_pending, "pending"),
        (item.is_edited, "edited"),
        (item.has_flag, "flagged"),
    ] {
        if flag {
            let _ = write!(line, " [{}]", label);
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_core::stats::SyncStats;
    use livesync_core::{CollectionLayout, Entity, EntityKind};

    fn make_item(id: &str, seq: u64) -> ViewItem {
        let mut entity = Entity::new(id, EntityKind::Comment, seq)
            .with_text(format!("text {}", id))
            .with_author("bob");
        entity.set_reaction("like", true);
        ViewItem {
            entity,
            is_own: false,
            is_pending: false,
            is_edited: false,
            has_flag: false,
        }
    }

    fn make_report(items: Vec<ViewItem>, nodes: Vec<ViewNode>) -> ReplayReport {
        ReplayReport {
            scope: "post:p1".to_string(),
            layout: CollectionLayout::Tree,
            items,
            nodes,
            warnings: Vec::new(),
            stats: SyncStats::new(),
        }
    }

    #[test]
    fn test_render_item_line() {
        let mut item = make_item("c1", 7);
        item.is_pending = true;
        assert_eq!(item_line(&item), "[7] bob: text c1 (like 1) [pending]");
    }

    #[test]
    fn test_render_tree_indents_replies() {
        let node = ViewNode {
            item: make_item("c1", 1),
            children: vec![ViewNode {
                item: make_item("r1", 2),
                children: Vec::new(),
                expanded: false,
                has_more_replies: false,
            }],
            expanded: true,
            has_more_replies: true,
        };
        let text = render_text(&make_report(Vec::new(), vec![node]));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# post:p1");
        assert!(lines[1].starts_with("[1] bob: text c1") && lines[1].ends_with("[more replies]"));
        assert!(lines[2].starts_with("  [2] bob: text r1"));
    }

    #[test]
    fn test_render_empty_and_json() {
        let report = make_report(Vec::new(), Vec::new());
        assert!(render_text(&report).contains("(empty)"));

        let json: serde_json::Value =
            serde_json::from_str(&render_json(&report, false).unwrap()).unwrap();
        assert_eq!(json["scope"], "post:p1");
        assert_eq!(json["layout"], "tree");
        assert!(json.get("items").is_none());
    }
}
