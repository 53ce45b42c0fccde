use tabpilot_core::{Error, Result};
use url::Url;

/// Placeholders available to action URLs and header values.
pub struct TemplateContext<'a> {
    pub base_url: &'a str,
    pub session_id: &'a str,
}

/// Path between the leading `/` and the last `/`, e.g. `shop/api` for `/shop/api/cart`.
fn base_path(url: &Url) -> &str {
    let path = url.path();
    match path.rfind('/') {
        Some(end) if end > 0 => &path[1..end],
        _ => "",
    }
}

/// Substitute `${origin}`, `${basePath}` and `${sessionId}`; origin and base
/// path come from `base_url`.
pub fn solve_url_template(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let url = Url::parse(ctx.base_url)
        .map_err(|e| Error::Validation(format!("invalid url '{}': {}", ctx.base_url, e)))?;
    Ok(template
        .replace("${origin}", &url.origin().ascii_serialization())
        .replace("${basePath}", base_path(&url))
        .replace("${sessionId}", ctx.session_id))
}

pub fn solve_session_template(template: &str, session_id: &str) -> String {
    template.replace("${sessionId}", session_id)
}
