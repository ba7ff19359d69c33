use std::fmt::Write as _;

use crate::walker::TreeNode;

/// Render a listing as indented text, one entry per line.
///
/// Directories end with `/`. Ignored entries carry `[gitignored]` and/or
/// `[ignored]` (custom rules).
pub fn render_tree(root: &TreeNode) -> String {
    let mut out = String::new();
    push_line(&mut out, "", root);
    render_children(&mut out, &root.children, "");
    out
}

fn render_children(out: &mut String, children: &[TreeNode], prefix: &str) {
    let last = children.len().saturating_sub(1);
    for (i, node) in children.iter().enumerate() {
        let (branch, child_prefix) = if i == last {
            ("└── ", format!("{prefix}    "))
        } else {
            ("├── ", format!("{prefix}│   "))
        };
        push_line(out, &format!("{prefix}{branch}"), node);
        render_children(out, &node.children, &child_prefix);
    }
}

fn push_line(out: &mut String, lead: &str, node: &TreeNode) {
    let slash = if node.is_dir { "/" } else { "" };
    let _ = write!(out, "{lead}{}{slash}", node.name);
    if node.gitignored {
        out.push_str(" [gitignored]");
    }
    if node.custom_ignored {
        out.push_str(" [ignored]");
    }
    out.push('\n');
}

/// Print a listing to stdout, as text or pretty JSON.
pub fn print_tree(root: &TreeNode, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(root)?);
    } else {
        print!("{}", render_tree(root));
    }
    Ok(())
}
