//! Static site content for one portal generation.

use bytes::Bytes;
use serde_json::json;
use uuid::Uuid;

use crate::deployment::publish::SiteAsset;
use crate::errors::AppError;
use crate::models::document::{DocumentSection, StructuredDocument};
use crate::models::portal::PortalConfiguration;

/// The attribute the health check looks for on the generated root page.
pub fn health_marker(slug: &str) -> String {
    format!("data-portal=\"{slug}\"")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn render_section(section: &DocumentSection) -> String {
    let mut html = format!(
        "<section class=\"portal-section\">\n<h2>{}</h2>\n",
        escape_html(&section.label)
    );
    for paragraph in section.text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        html.push_str(&format!("<p>{}</p>\n", escape_html(paragraph)));
    }
    let items: Vec<&str> = section
        .items
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .collect();
    if !items.is_empty() {
        html.push_str("<ul>\n");
        for item in items {
            html.push_str(&format!("<li>{}</li>\n", escape_html(item)));
        }
        html.push_str("</ul>\n");
    }
    html.push_str("</section>\n");
    html
}

/// Renders `index.html` and `portal.json` for a generation. `document` must
/// already be limited to the portal's enabled sections.
pub fn render_site(
    portal: &PortalConfiguration,
    document: &StructuredDocument,
    run_id: Uuid,
    chunk_count: usize,
) -> Result<Vec<SiteAsset>, AppError> {
    let sections: Vec<&DocumentSection> =
        document.sections.iter().filter(|s| !s.is_blank()).collect();
    if sections.is_empty() {
        return Err(AppError::Validation(
            "portal has no content to publish".to_string(),
        ));
    }

    let name = escape_html(&portal.name);
    let mut body = String::new();
    for section in &sections {
        body.push_str(&render_section(section));
    }
    if portal.features.chat_enabled {
        body.push_str(&format!(
            "<div id=\"portal-chat\" data-portal-id=\"{}\"></div>\n",
            portal.id
        ));
    }
    if portal.features.resume_download {
        body.push_str("<a class=\"portal-download\" href=\"resume.pdf\">Download résumé</a>\n");
    }

    let index = format!(
        "<!DOCTYPE html>\n<html lang=\"en\" {marker}>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{name}</title>\n<link rel=\"stylesheet\" href=\"/themes/{theme}.css\">\n\
         </head>\n<body>\n<h1>{name}</h1>\n{body}</body>\n</html>\n",
        marker = health_marker(&portal.slug),
        theme = escape_html(&portal.theme),
    );

    let manifest = json!({
        "portal_id": portal.id,
        "run_id": run_id,
        "slug": portal.slug,
        "name": portal.name,
        "theme": portal.theme,
        "visibility": portal.visibility.as_str(),
        "features": portal.features,
        "sections": sections.iter().map(|s| s.label.as_str()).collect::<Vec<_>>(),
        "chunks": chunk_count,
    });

    Ok(vec![
        SiteAsset {
            path: "index.html".to_string(),
            content_type: "text/html; charset=utf-8",
            body: Bytes::from(index),
        },
        SiteAsset {
            path: "portal.json".to_string(),
            content_type: "application/json",
            body: Bytes::from(manifest.to_string()),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::resume_document;

    fn portal() -> PortalConfiguration {
        PortalConfiguration::new_draft(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Jane <Doe>".into(),
            "jane-doe".into(),
        )
    }

    #[test]
    fn test_index_carries_health_marker_and_escapes_text() {
        let portal = portal();
        let assets = render_site(&portal, &resume_document(), Uuid::new_v4(), 3).unwrap();
        let index = assets.iter().find(|a| a.path == "index.html").unwrap();
        let html = std::str::from_utf8(&index.body).unwrap();
        assert!(html.contains(&health_marker("jane-doe")));
        assert!(html.contains("Jane &lt;Doe&gt;"));
        assert!(html.contains("<h2>Skills</h2>"));
        assert!(html.contains("portal-chat"));
    }

    #[test]
    fn test_empty_document_is_rejected() {
        let mut doc = resume_document();
        doc.sections.clear();
        let err = render_site(&portal(), &doc, Uuid::new_v4(), 0).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
