//! Status page listing the running editors

use crate::registry::InstanceStatus;
use std::fmt::Write;

/// Escape text for HTML element content and attribute values
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Render the status page for a registry snapshot
pub fn render(instances: &[InstanceStatus], ports_in_use: usize, port_capacity: usize) -> String {
    let editors = instances.iter().filter(|i| !i.assets).count();

    let mut rows = String::new();
    for instance in instances {
        let tenant = escape_html(&instance.tenant);
        let name = if instance.assets {
            format!("{} <em>(shared assets)</em>", tenant)
        } else {
            format!(r#"<a href="/@{0}/">@{0}</a>"#, tenant)
        };
        let state = if instance.alive { "running" } else { "exited" };
        let _ = writeln!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}s</td></tr>",
            name, instance.port, state, instance.idle_secs
        );
    }

    let table = if instances.is_empty() {
        "<p>No active editors.</p>".to_string()
    } else {
        format!(
            "<table>\n<tr><th>Garden</th><th>Port</th><th>State</th><th>Idle</th></tr>\n{}</table>",
            rows
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Bullpen</title>
<style>
body {{ font-family: sans-serif; margin: 2em; }}
table {{ border-collapse: collapse; }}
th, td {{ padding: 0.3em 1em; border-bottom: 1px solid #ccc; text-align: left; }}
</style>
</head>
<body>
<h1>Bullpen</h1>
<p>{editors} active editor(s), {ports_in_use} of {port_capacity} ports in use.</p>
{table}
</body>
</html>
"#
    )
}
