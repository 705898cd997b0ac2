//! Turning server MOTDs into something an API client can use.
//!
//! Java servers describe their MOTD either as a legacy string with `§`
//! formatting codes or as a JSON chat component tree; Bedrock servers only
//! use the legacy form. Both are reduced to the same triple: the raw text,
//! a stripped plain-text rendition, and an HTML rendition.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motd {
    pub raw: String,
    pub clean: String,
    pub html: String,
}

/// The `description` field of a Java status response.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    Component(ChatComponent),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatComponent {
    pub text: String,
    pub color: Option<String>,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub underlined: Option<bool>,
    pub strikethrough: Option<bool>,
    pub obfuscated: Option<bool>,
    pub extra: Vec<ChatComponent>,
}

impl Motd {
    pub fn from_description(description: &Description) -> Self {
        match description {
            Description::Text(text) => Self::from_legacy(text),
            Description::Component(component) => Self::from_component(component),
        }
    }

    pub fn from_legacy(text: &str) -> Self {
        Motd {
            raw: text.to_owned(),
            clean: strip_legacy_codes(text),
            html: legacy_to_html(text),
        }
    }

    pub fn from_component(component: &ChatComponent) -> Self {
        let raw = flatten_component(component);
        let mut html = String::new();
        render_component_html(component, &Style::default(), &mut html);
        Motd {
            clean: strip_legacy_codes(&raw),
            raw,
            html,
        }
    }
}

/// Remove `§` formatting codes. Any `§` is dropped, along with the
/// following character when it is a valid code (`[0-9a-fk-or]`, either
/// case); the output therefore never contains `§` and a second pass is a
/// no-op.
pub fn strip_legacy_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{a7}' {
            if chars.peek().copied().is_some_and(is_format_code) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn is_format_code(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), '0'..='9' | 'a'..='f' | 'k'..='o' | 'r')
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Style {
    color: Option<&'static str>,
    bold: bool,
    italic: bool,
    underlined: bool,
    strikethrough: bool,
}

impl Style {
    fn css(&self) -> String {
        let mut css = String::new();
        if let Some(color) = self.color {
            write!(css, "color: {color};").ok();
        }
        if self.bold {
            css.push_str("font-weight: bold;");
        }
        if self.italic {
            css.push_str("font-style: italic;");
        }
        match (self.underlined, self.strikethrough) {
            (true, true) => css.push_str("text-decoration: underline line-through;"),
            (true, false) => css.push_str("text-decoration: underline;"),
            (false, true) => css.push_str("text-decoration: line-through;"),
            (false, false) => {}
        }
        css
    }
}

fn color_hex(code: char) -> Option<&'static str> {
    Some(match code.to_ascii_lowercase() {
        '0' => "#000000",
        '1' => "#0000AA",
        '2' => "#00AA00",
        '3' => "#00AAAA",
        '4' => "#AA0000",
        '5' => "#AA00AA",
        '6' => "#FFAA00",
        '7' => "#AAAAAA",
        '8' => "#555555",
        '9' => "#5555FF",
        'a' => "#55FF55",
        'b' => "#55FFFF",
        'c' => "#FF5555",
        'd' => "#FF55FF",
        'e' => "#FFFF55",
        'f' => "#FFFFFF",
        _ => return None,
    })
}

fn named_color_hex(name: &str) -> Option<&'static str> {
    Some(match name {
        "black" => "#000000",
        "dark_blue" => "#0000AA",
        "dark_green" => "#00AA00",
        "dark_aqua" => "#00AAAA",
        "dark_red" => "#AA0000",
        "dark_purple" => "#AA00AA",
        "gold" => "#FFAA00",
        "gray" => "#AAAAAA",
        "dark_gray" => "#555555",
        "blue" => "#5555FF",
        "green" => "#55FF55",
        "aqua" => "#55FFFF",
        "red" => "#FF5555",
        "light_purple" => "#FF55FF",
        "yellow" => "#FFFF55",
        "white" => "#FFFFFF",
        _ => return None,
    })
}

fn escape_html(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("<br>"),
            _ => out.push(c),
        }
    }
}

fn flush_span(text: &str, style: &Style, out: &mut String) {
    if text.is_empty() {
        return;
    }
    let css = style.css();
    if css.is_empty() {
        escape_html(text, out);
    } else {
        write!(out, "<span style=\"{css}\">").ok();
        escape_html(text, out);
        out.push_str("</span>");
    }
}

fn legacy_to_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut style = Style::default();
    let mut run = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{a7}' {
            let Some(&code) = chars.peek() else { continue };
            if !is_format_code(code) {
                continue;
            }
            chars.next();
            flush_span(&run, &style, &mut out);
            run.clear();
            if let Some(hex) = color_hex(code) {
                // a color code also resets the active styles
                style = Style {
                    color: Some(hex),
                    ..Style::default()
                };
            } else {
                match code.to_ascii_lowercase() {
                    'l' => style.bold = true,
                    'o' => style.italic = true,
                    'n' => style.underlined = true,
                    'm' => style.strikethrough = true,
                    'r' => style = Style::default(),
                    // 'k' (obfuscated) has no HTML rendition
                    _ => {}
                }
            }
            continue;
        }
        run.push(c);
    }
    flush_span(&run, &style, &mut out);
    out
}

fn flatten_component(component: &ChatComponent) -> String {
    let mut out = String::new();
    fn walk(component: &ChatComponent, out: &mut String) {
        out.push_str(&component.text);
        for child in &component.extra {
            walk(child, out);
        }
    }
    walk(component, &mut out);
    out
}

fn render_component_html(component: &ChatComponent, inherited: &Style, out: &mut String) {
    let style = Style {
        color: component
            .color
            .as_deref()
            .and_then(named_color_hex)
            .or(inherited.color),
        bold: component.bold.unwrap_or(inherited.bold),
        italic: component.italic.unwrap_or(inherited.italic),
        underlined: component.underlined.unwrap_or(inherited.underlined),
        strikethrough: component.strikethrough.unwrap_or(inherited.strikethrough),
    };
    // components may themselves carry legacy codes in their text
    if component.text.contains('\u{a7}') {
        out.push_str(&legacy_to_html(&component.text));
    } else {
        flush_span(&component.text, &style, out);
    }
    for child in &component.extra {
        render_component_html(child, &style, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_every_code_pair() {
        assert_eq!(strip_legacy_codes("§cHello §lWorld§r!"), "Hello World!");
        assert_eq!(strip_legacy_codes("§CUPPER§Rcase"), "UPPERcase");
        assert_eq!(strip_legacy_codes("plain"), "plain");
    }

    #[test]
    fn strip_is_idempotent() {
        for input in ["§cred", "§§ll", "trailing§", "§zkeep", "a§k§o§rb"] {
            let once = strip_legacy_codes(input);
            assert_eq!(strip_legacy_codes(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn legacy_html_opens_spans_for_colors_and_styles() {
        let html = legacy_to_html("§cred §lbold");
        assert_eq!(
            html,
            "<span style=\"color: #FF5555;\">red </span>\
             <span style=\"color: #FF5555;font-weight: bold;\">bold</span>"
        );
    }

    #[test]
    fn html_escapes_markup() {
        let motd = Motd::from_legacy("a <b> & \"c\"");
        assert_eq!(motd.html, "a &lt;b&gt; &amp; &quot;c&quot;");
    }

    #[test]
    fn component_tree_flattens_and_inherits() {
        let description: Description = serde_json::from_str(
            r##"{"text":"Hello ","color":"gold","extra":[{"text":"world","bold":true}]}"##,
        )
        .unwrap();
        let motd = Motd::from_description(&description);
        assert_eq!(motd.raw, "Hello world");
        assert_eq!(motd.clean, "Hello world");
        assert!(motd.html.contains("color: #FFAA00;font-weight: bold;"));
    }

    #[test]
    fn plain_string_description() {
        let description: Description = serde_json::from_str(r#""A Minecraft Server""#).unwrap();
        let motd = Motd::from_description(&description);
        assert_eq!(motd.raw, "A Minecraft Server");
        assert_eq!(motd.html, "A Minecraft Server");
    }
}
