//! Markdown to HTML, with syntect highlighting for fenced code blocks.

use pulldown_cmark::{CodeBlockKind, CowStr, Event, Options, Parser, Tag};
use std::sync::OnceLock;
use syntect::highlighting::ThemeSet;
use syntect::html::{css_for_theme_with_class_style, ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

/// Prefix avoids clashes with dashboard CSS.
fn class_style() -> ClassStyle {
    ClassStyle::SpacedPrefixed { prefix: "hl-" }
}

fn syntax_set() -> &'static SyntaxSet {
    static SYNTAXES: OnceLock<SyntaxSet> = OnceLock::new();
    SYNTAXES.get_or_init(SyntaxSet::load_defaults_newlines)
}

/// Stylesheet for highlighted code blocks (cached).
pub fn highlight_css() -> &'static str {
    static CSS: OnceLock<String> = OnceLock::new();
    CSS.get_or_init(|| {
        let themes = ThemeSet::load_defaults();
        themes
            .themes
            .get("base16-ocean.dark")
            .or_else(|| themes.themes.values().next())
            .and_then(|theme| css_for_theme_with_class_style(theme, class_style()).ok())
            .unwrap_or_default()
    })
}

fn syntax_token(lang: &str) -> String {
    match lang.to_lowercase().as_str() {
        "luau" => "lua".to_string(),
        "yml" => "yaml".to_string(),
        "sh" | "shell" | "bash" => "bash".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Highlights `source` as `lang`. Unknown languages render as plain text.
pub fn highlight_code_block(lang: &str, source: &str) -> String {
    let syntaxes = syntax_set();
    let syntax = syntaxes
        .find_syntax_by_token(&syntax_token(lang))
        .unwrap_or_else(|| syntaxes.find_syntax_plain_text());

    let mut generator = ClassedHTMLGenerator::new_with_class_style(syntax, syntaxes, class_style());
    for line in LinesWithEndings::from(source) {
        if generator.parse_html_for_line_which_includes_newline(line).is_err() {
            return escape_html(source);
        }
    }
    generator.finalize()
}

fn code_block_html(lang: &str, source: &str) -> String {
    if lang.is_empty() {
        return format!("<pre><code>{}</code></pre>\n", escape_html(source));
    }
    format!(
        "<pre><code class=\"language-{}\">{}</code></pre>\n",
        escape_html(lang),
        highlight_code_block(lang, source)
    )
}

fn is_block(tag: &Tag) -> bool {
    !matches!(
        tag,
        Tag::Emphasis | Tag::Strong | Tag::Strikethrough | Tag::Link(..) | Tag::Image(..)
    )
}

/// Collects output events. In inline mode block tags are dropped and each
/// block boundary becomes a line break, so adjacent blocks never run together.
struct EventSink<'a> {
    events: Vec<Event<'a>>,
    wrap: bool,
    boundary: bool,
}

impl<'a> EventSink<'a> {
    fn push(&mut self, event: Event<'a>) {
        if self.boundary && !self.events.is_empty() {
            self.events.push(Event::SoftBreak);
        }
        self.boundary = false;
        self.events.push(event);
    }

    fn code_block(&mut self, lang: &str, source: &str) {
        if self.wrap {
            self.push(Event::Html(CowStr::from(code_block_html(lang, source))));
        } else {
            self.boundary = true;
            self.push(Event::Code(CowStr::from(source.trim_end_matches('\n').to_string())));
            self.boundary = true;
        }
    }
}

/// Renders markdown. With `wrap` off only inline markup is rendered: no
/// paragraphs, headings, lists or tables, and block boundaries become `\n`.
pub fn render_markdown(text: &str, wrap: bool) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut sink = EventSink {
        events: Vec::new(),
        wrap,
        boundary: false,
    };
    let mut code: Option<(String, String)> = None;

    for event in Parser::new_ext(text, options) {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let lang = match kind {
                    CodeBlockKind::Fenced(info) => info.split_whitespace().next().unwrap_or("").to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                code = Some((lang, String::new()));
            }
            Event::End(Tag::CodeBlock(_)) => {
                if let Some((lang, source)) = code.take() {
                    sink.code_block(&lang, &source);
                }
            }
            Event::Text(content) if code.is_some() => {
                if let Some((_, source)) = code.as_mut() {
                    source.push_str(&content);
                }
            }
            Event::Start(tag) | Event::End(tag) if !wrap && is_block(&tag) => sink.boundary = true,
            Event::Rule if !wrap => sink.boundary = true,
            other => sink.push(other),
        }
    }

    let mut html = String::with_capacity(text.len() * 3 / 2);
    pulldown_cmark::html::push_html(&mut html, sink.events.into_iter());
    html
}
