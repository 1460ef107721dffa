//! Allow-list HTML sanitizer for rendered panel content.
//!
//! Tags outside the list are escaped so they show up as text. Kept tags lose
//! their event handler attributes and any script URL.

const ALLOWED_TAGS: &[&str] = &[
    "a", "abbr", "b", "blockquote", "br", "button", "canvas", "caption", "center", "code", "col",
    "colgroup", "dd", "del", "details", "div", "dl", "dt", "em", "figcaption", "figure", "font",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "i", "img", "input", "ins", "kbd",
    "label", "li", "mark", "ol", "p", "pre", "q", "s", "section", "small", "span", "strike",
    "strong", "sub", "summary", "sup", "table", "tbody", "td", "tfoot", "th", "thead", "tr", "u",
    "ul",
];

const URL_ATTRIBUTES: &[&str] = &["href", "src", "action", "formaction", "xlink:href", "background", "poster"];

struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
    attributes: Vec<(String, Option<String>)>,
}

impl Tag {
    fn render(&self) -> String {
        if self.closing {
            return format!("</{}>", self.name);
        }
        let mut out = format!("<{}", self.name);
        for (name, value) in &self.attributes {
            match value {
                Some(value) => {
                    out.push_str(&format!(" {}=\"{}\"", name, escape_attribute(value)));
                }
                None => {
                    out.push(' ');
                    out.push_str(name);
                }
            }
        }
        if self.self_closing {
            out.push_str(" /");
        }
        out.push('>');
        out
    }
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Decodes the entities an attacker could use to hide a URL scheme.
fn decode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "colon" => Some(':'),
            "Tab" => Some('\t'),
            "NewLine" => Some('\n'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_script_url(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_lowercase();
    normalized.starts_with("javascript:")
        || normalized.starts_with("vbscript:")
        || (normalized.starts_with("data:") && !normalized.starts_with("data:image/"))
}

fn keep_attribute(name: &str, value: Option<&str>) -> bool {
    if name.starts_with("on") || name == "srcdoc" {
        return false;
    }
    match value {
        Some(value) if URL_ATTRIBUTES.contains(&name) => !is_script_url(value),
        _ => true,
    }
}

fn skip_whitespace(s: &str, mut pos: usize) -> usize {
    while let Some(c) = s[pos..].chars().next() {
        if !c.is_whitespace() {
            break;
        }
        pos += c.len_utf8();
    }
    pos
}

/// Parses the tag at the start of `s` (which begins with `<`). Returns the
/// tag and the number of bytes it spans, or `None` when `s` does not start
/// with a complete tag.
fn parse_tag(s: &str) -> Option<(Tag, usize)> {
    let mut pos = 1;
    let closing = s[pos..].starts_with('/');
    if closing {
        pos += 1;
    }

    let name_len = s[pos..]
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(s.len() - pos);
    if name_len == 0 {
        return None;
    }
    let name = s[pos..pos + name_len].to_ascii_lowercase();
    pos += name_len;

    let mut tag = Tag {
        name,
        closing,
        self_closing: false,
        attributes: Vec::new(),
    };

    loop {
        pos = skip_whitespace(s, pos);
        let c = s[pos..].chars().next()?;
        match c {
            '>' => return Some((tag, pos + 1)),
            '/' => {
                tag.self_closing = true;
                pos += 1;
                continue;
            }
            _ => {}
        }

        let attr_len = s[pos..]
            .find(|c: char| c.is_whitespace() || c == '=' || c == '>' || c == '/')
            .unwrap_or(s.len() - pos);
        if attr_len == 0 {
            // stray '=' or similar
            pos += c.len_utf8();
            continue;
        }
        let attr_name = s[pos..pos + attr_len].to_ascii_lowercase();
        pos = skip_whitespace(s, pos + attr_len);

        let mut value = None;
        if s[pos..].starts_with('=') {
            pos = skip_whitespace(s, pos + 1);
            let quote = s[pos..].chars().next()?;
            if quote == '"' || quote == '\'' {
                let end = s[pos + 1..].find(quote)?;
                value = Some(decode_entities(&s[pos + 1..pos + 1 + end]));
                pos += end + 2;
            } else {
                let len = s[pos..]
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(s.len() - pos);
                value = Some(decode_entities(&s[pos..pos + len]));
                pos += len;
            }
        }

        if keep_attribute(&attr_name, value.as_deref()) {
            tag.attributes.push((attr_name, value));
        }
    }
}

/// Keeps allowed tags (cleaned) and escapes everything else. Comments are
/// dropped.
pub fn sanitize_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if let Some(comment) = rest.strip_prefix("<!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        match parse_tag(rest) {
            Some((tag, len)) if ALLOWED_TAGS.contains(&tag.name.as_str()) => {
                out.push_str(&tag.render());
                rest = &rest[len..];
            }
            _ => {
                out.push_str("&lt;");
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
