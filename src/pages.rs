//! Server-side HTML for the handful of human-facing pages: landing,
//! consent, errors, and the operator admin surface. Deliberately plain
//! markup; theming belongs to a front proxy.

use crate::authorize::ConsentContext;
use crate::store::{CodeRecord, ProfilesScopes};

/// Minimal HTML entity escaping for interpolated text and attributes.
pub fn html_escape(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            other => other.to_string(),
        })
        .collect()
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
</head>
<body>
<h1>{title}</h1>
{body}
</body>
</html>"#,
        title = html_escape(title),
        body = body,
    )
}

/// The informational landing page.
pub fn landing(self_base_url: &str) -> String {
    let body = format!(
        r#"<p>This is an IndieAuth authorization server. It identifies its
operator to client applications by profile URL and issues access
tokens for resources they serve.</p>
<p>Server identity: <code>{}</code></p>
<ul>
<li><a href="./.well-known/oauth-authorization-server">Server metadata</a></li>
<li><a href="./admin">Operator administration</a></li>
</ul>"#,
        html_escape(self_base_url),
    );
    layout("IndieAuth", &body)
}

/// A 4xx/5xx page carrying the accumulated error descriptions.
pub fn error_page(title: &str, descriptions: &[String]) -> String {
    let items: String = descriptions
        .iter()
        .map(|d| format!("<li>{}</li>\n", html_escape(d)))
        .collect();
    layout(title, &format!("<ul>\n{items}</ul>"))
}

/// The consent form. The sealed continuation rides in a hidden field;
/// nothing else about the in-flight authorization is kept server-side.
pub fn consent_page(ctx: &ConsentContext, consent_path: &str) -> String {
    let client = match &ctx.client_name {
        Some(name) => format!(
            "{} (<code>{}</code>)",
            html_escape(name),
            html_escape(&ctx.client_id)
        ),
        None => format!("<code>{}</code>", html_escape(&ctx.client_id)),
    };

    let profile_options: String = ctx
        .profiles
        .iter()
        .map(|profile| {
            let selected = if ctx.preselected_me.as_deref() == Some(profile.as_str()) {
                " selected"
            } else {
                ""
            };
            format!(
                r#"<option value="{0}"{1}>{0}</option>"#,
                html_escape(profile),
                selected
            )
        })
        .collect();

    let scope_rows: String = ctx
        .scope_choices
        .iter()
        .map(|choice| {
            let checked = if choice.checked { " checked" } else { "" };
            format!(
                r#"<li><label><input type="checkbox" name="accepted_scopes" value="{scope}"{checked}> {scope} <small>{desc}</small></label></li>
"#,
                scope = html_escape(&choice.scope),
                desc = html_escape(&choice.description),
                checked = checked,
            )
        })
        .collect();

    let body = format!(
        r#"<p>{client} is asking to identify you.</p>
<form method="post" action="{action}">
<input type="hidden" name="session" value="{session}">
<fieldset>
<legend>Identify as</legend>
<select name="me">{profile_options}</select>
</fieldset>
<fieldset>
<legend>Grant scopes</legend>
<ul>
{scope_rows}</ul>
<label>Additional scopes (space separated):
<input type="text" name="ad_hoc_scopes"></label>
</fieldset>
<fieldset>
<legend>Token lifetime</legend>
<select name="expires">
<option value="never">Never expires</option>
<option value="1d">1 day</option>
<option value="1w">1 week</option>
<option value="1m">1 month</option>
<option value="custom">Custom seconds:</option>
</select>
<input type="number" name="expires-seconds" min="1">
<select name="refresh">
<option value="never">No refresh</option>
<option value="1d">Refreshable for 1 day</option>
<option value="1w">Refreshable for 1 week</option>
<option value="1m">Refreshable for 1 month</option>
<option value="custom">Custom seconds:</option>
</select>
<input type="number" name="refresh-seconds" min="1">
</fieldset>
<button type="submit" name="accept" value="true">Allow</button>
<button type="submit" name="accept" value="false">Deny</button>
</form>"#,
        client = client,
        action = html_escape(consent_path),
        session = html_escape(&ctx.continuation),
        profile_options = profile_options,
        scope_rows = scope_rows,
    );
    layout("Authorization request", &body)
}

/// Operator admin page: profile scope defaults and active tokens.
pub fn admin_page(
    admin_path: &str,
    profiles_scopes: &ProfilesScopes,
    tokens: &[CodeRecord],
) -> String {
    let mut sections = String::new();

    for profile in &profiles_scopes.profiles {
        let scopes = profiles_scopes
            .profile_scopes
            .get(profile)
            .map(|scopes| {
                scopes
                    .keys()
                    .map(|scope| format!("<li><code>{}</code></li>", html_escape(scope)))
                    .collect::<String>()
            })
            .unwrap_or_default();
        sections.push_str(&format!(
            r#"<section>
<h3><code>{profile}</code></h3>
<ul>{scopes}</ul>
<form method="post" action="{action}">
<input type="hidden" name="action" value="set-scopes">
<input type="hidden" name="profile" value="{profile}">
<label>Default scopes (space separated):
<input type="text" name="scopes"></label>
<button type="submit">Save</button>
</form>
</section>
"#,
            profile = html_escape(profile),
            scopes = scopes,
            action = html_escape(admin_path),
        ));
    }

    let token_rows: String = tokens
        .iter()
        .map(|token| {
            let status = if token.is_revoked { "revoked" } else { "active" };
            format!(
                r#"<tr><td><code>{id}</code></td><td>{client}</td><td>{scopes}</td><td>{status}</td>
<td><form method="post" action="{action}">
<input type="hidden" name="action" value="revoke">
<input type="hidden" name="code_id" value="{id}">
<button type="submit">Revoke</button></form></td></tr>
"#,
                id = token.code_id,
                client = html_escape(&token.client_id),
                scopes = html_escape(&token.scopes.join(" ")),
                status = status,
                action = html_escape(admin_path),
            )
        })
        .collect();

    let body = format!(
        r#"<h2>Profiles</h2>
{sections}
<h2>Tokens</h2>
<table>
<tr><th>Code</th><th>Client</th><th>Scopes</th><th>Status</th><th></th></tr>
{token_rows}</table>
<h2>Maintenance</h2>
<form method="post" action="{action}/maintenance">
<button type="submit">Run chores now</button>
</form>
<p><a href="{action}/ticket">Offer a ticket</a></p>"#,
        sections = sections,
        token_rows = token_rows,
        action = html_escape(admin_path),
    );
    layout("Administration", &body)
}

/// Ticket minting form, with the outcome of a previous submission.
pub fn admin_ticket_page(
    admin_path: &str,
    profiles: &[String],
    notice: Option<&str>,
) -> String {
    let profile_options: String = profiles
        .iter()
        .map(|p| format!(r#"<option value="{0}">{0}</option>"#, html_escape(p)))
        .collect();
    let notice = notice
        .map(|n| format!("<p><strong>{}</strong></p>", html_escape(n)))
        .unwrap_or_default();

    let body = format!(
        r#"{notice}<form method="post" action="{action}/ticket">
<label>Profile: <select name="profile">{profile_options}</select></label><br>
<label>Resource URL: <input type="url" name="resource" required></label><br>
<label>Subject URL: <input type="url" name="subject" required></label><br>
<label>Scopes (space separated): <input type="text" name="scopes" required></label><br>
<button type="submit">Mint and deliver</button>
</form>"#,
        notice = notice,
        action = html_escape(admin_path),
        profile_options = profile_options,
    );
    layout("Offer a ticket", &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorize::ScopeChoice;

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"<a href="x">&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_consent_page_carries_session_and_scopes() {
        let ctx = ConsentContext {
            continuation: "sealed-continuation".to_string(),
            client_id: "https://app.example/".to_string(),
            client_name: Some("Example <App>".to_string()),
            profiles: vec!["https://alice.example/".to_string()],
            preselected_me: Some("https://alice.example/".to_string()),
            scope_choices: vec![ScopeChoice {
                scope: "profile".to_string(),
                description: "who you are".to_string(),
                checked: true,
            }],
        };
        let html = consent_page(&ctx, "/consent");

        assert!(html.contains("sealed-continuation"));
        assert!(html.contains("Example &lt;App&gt;"));
        assert!(html.contains(r#"value="profile" checked"#));
        assert!(html.contains(r#"option value="https://alice.example/" selected"#));
        assert!(html.contains(r#"name="accept" value="false""#));
    }

    #[test]
    fn test_error_page_escapes_descriptions() {
        let html = error_page(
            "Bad request",
            &["missing state".to_string(), "<script>".to_string()],
        );
        assert!(html.contains("missing state"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
