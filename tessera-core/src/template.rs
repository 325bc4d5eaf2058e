//! Template value model.
//!
//! A [`Template`] is one evaluated template invocation: literal fragments
//! (`statics`) interleaved with interpolated values (`dynamics`), always with
//! `statics.len() == dynamics.len() + 1`. [`Template::to_parts`] lowers it into
//! the rendered-tree shape sent to clients.
//!
//! ```text
//! html!("<p>{}</p>", name)
//!        │
//!        ▼
//! Template { statics: ["<p>", "</p>"], dynamics: [Text(name)] }
//!        │  to_parts()
//!        ▼
//! { "0": "escaped name", "s": ["<p>", "</p>"] }
//! ```

use std::any::Any;
use std::fmt;

use log::warn;

use crate::escape::escape_html;
use crate::parts::{Cid, Part, Parts};

/// Opaque reference to a nested unit that has not been resolved yet.
///
/// The core never looks inside; the lifecycle layer downcasts the payload and
/// replaces the reference with a [`Dynamic::Placeholder`] or an inlined
/// [`Dynamic::Template`] before lowering.
pub struct ComponentRef {
    label: &'static str,
    payload: Box<dyn Any + Send>,
}

impl ComponentRef {
    pub fn new<T: Any + Send>(label: &'static str, payload: T) -> Self {
        Self {
            label,
            payload: Box::new(payload),
        }
    }

    /// Human-readable name of the referenced unit, for diagnostics.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRef").field("label", &self.label).finish()
    }
}

/// One interpolated value.
#[derive(Debug)]
pub enum Dynamic {
    /// Scalar in textual form; escaped when lowered.
    Text(String),
    /// Nested template.
    Template(Template),
    /// Sequence of values, usually templates sharing one shape.
    List(Vec<Dynamic>),
    /// Stateful nested unit already assigned a handle.
    Placeholder(Cid),
    /// Nested unit awaiting resolution.
    Component(ComponentRef),
}

impl Dynamic {
    fn write_text(&self, out: &mut String) {
        match self {
            Dynamic::Text(text) => out.push_str(&escape_html(text)),
            Dynamic::Template(template) => template.write_text(out),
            Dynamic::List(items) => items.iter().for_each(|item| item.write_text(out)),
            Dynamic::Placeholder(_) | Dynamic::Component(_) => {}
        }
    }
}

macro_rules! dynamic_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Dynamic {
                fn from(value: $ty) -> Self {
                    Dynamic::Text(value.to_string())
                }
            }
        )*
    };
}

dynamic_from_display!(&str, &String, String, char, bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<Template> for Dynamic {
    fn from(template: Template) -> Self {
        Dynamic::Template(template)
    }
}

impl From<Vec<Template>> for Dynamic {
    fn from(templates: Vec<Template>) -> Self {
        Dynamic::List(templates.into_iter().map(Dynamic::Template).collect())
    }
}

impl From<Vec<Dynamic>> for Dynamic {
    fn from(items: Vec<Dynamic>) -> Self {
        Dynamic::List(items)
    }
}

impl<T: Into<Dynamic>> From<Option<T>> for Dynamic {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(|| Dynamic::Text(String::new()), Into::into)
    }
}

/// An evaluated template.
#[derive(Debug)]
pub struct Template {
    statics: Vec<String>,
    dynamics: Vec<Dynamic>,
}

impl Template {
    /// Build a template from fragments and values.
    ///
    /// # Panics
    ///
    /// Panics unless `statics.len() == dynamics.len() + 1`.
    pub fn new<S: Into<String>>(statics: Vec<S>, dynamics: Vec<Dynamic>) -> Self {
        assert_eq!(
            statics.len(),
            dynamics.len() + 1,
            "template needs exactly one more literal fragment than interpolated values"
        );
        Self {
            statics: statics.into_iter().map(Into::into).collect(),
            dynamics,
        }
    }

    /// Build a template from a format string whose `{}` markers are the
    /// interpolation points.
    ///
    /// # Panics
    ///
    /// Panics when the number of markers differs from `dynamics.len()`.
    pub fn from_fmt(format: &str, dynamics: Vec<Dynamic>) -> Self {
        Self::new(format.split("{}").collect::<Vec<_>>(), dynamics)
    }

    /// Markup that is already safe and is emitted without escaping.
    pub fn raw(markup: impl Into<String>) -> Self {
        Self {
            statics: vec![markup.into()],
            dynamics: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::raw("")
    }

    /// Concatenate templates with a literal separator between them.
    pub fn join(items: Vec<Template>, separator: &str) -> Self {
        if items.is_empty() {
            return Self::empty();
        }
        let mut statics = Vec::with_capacity(items.len() + 1);
        statics.push(String::new());
        statics.extend((1..items.len()).map(|_| separator.to_string()));
        statics.push(String::new());
        Self::new(statics, items.into_iter().map(Dynamic::Template).collect())
    }

    pub fn statics(&self) -> &[String] {
        &self.statics
    }

    pub fn dynamics(&self) -> &[Dynamic] {
        &self.dynamics
    }

    /// True for a template with one fragment and nothing interpolated.
    pub fn is_static(&self) -> bool {
        self.dynamics.is_empty() && self.statics.len() == 1
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Dynamic>) {
        (self.statics, self.dynamics)
    }

    /// Lower this template into a rendered tree. `s` is always present.
    pub fn to_parts(&self) -> Parts {
        let mut parts = Parts::default();
        for (index, value) in self.dynamics.iter().enumerate() {
            parts.slots.insert(index, lower(value));
        }
        parts.statics = Some(self.statics.clone());
        parts
    }

    /// Cells of one `d` row: this template's slots without its fragments.
    fn to_row(&self) -> Vec<Part> {
        self.dynamics.iter().map(lower).collect()
    }

    fn write_text(&self, out: &mut String) {
        let mut fragments = self.statics.iter();
        if let Some(first) = fragments.next() {
            out.push_str(first);
        }
        for (value, fragment) in self.dynamics.iter().zip(fragments) {
            value.write_text(out);
            out.push_str(fragment);
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_text(&mut out);
        f.write_str(&out)
    }
}

fn lower(value: &Dynamic) -> Part {
    match value {
        Dynamic::Placeholder(cid) => Part::Cid(*cid),
        Dynamic::Template(template) if template.is_static() => {
            Part::Str(template.statics[0].clone())
        }
        Dynamic::Template(template) => Part::Tree(template.to_parts()),
        Dynamic::List(items) => lower_list(items),
        Dynamic::Text(text) => Part::Str(escape_html(text)),
        Dynamic::Component(reference) => {
            warn!("Unresolved nested unit '{}' lowered as empty text", reference.label());
            Part::Str(String::new())
        }
    }
}

fn lower_list(items: &[Dynamic]) -> Part {
    let Some(first) = items.first() else {
        return Part::Str(String::new());
    };

    if items.iter().all(|item| matches!(item, Dynamic::Placeholder(_))) {
        return Part::Tree(Parts {
            rows: Some(items.iter().map(|item| vec![lower(item)]).collect()),
            ..Parts::default()
        });
    }

    match first {
        Dynamic::Template(head) => {
            let rows = items
                .iter()
                .map(|item| match item {
                    Dynamic::Template(row) => row.to_row(),
                    other => vec![lower(other)],
                })
                .collect();
            Part::Tree(Parts {
                statics: Some(head.statics.clone()),
                rows: Some(rows),
                ..Parts::default()
            })
        }
        _ => {
            let mut flat = String::new();
            items.iter().for_each(|item| item.write_text(&mut flat));
            Part::Str(flat)
        }
    }
}

/// Build a [`Template`] from a format string with `{}` interpolation points.
///
/// ```
/// use tessera_core::html;
///
/// let count = 3;
/// let t = html!("<span>{}</span>", count);
/// assert_eq!(t.to_string(), "<span>3</span>");
/// ```
#[macro_export]
macro_rules! html {
    ($fmt:expr) => {
        $crate::template::Template::from_fmt($fmt, ::std::vec::Vec::new())
    };
    ($fmt:expr, $($value:expr),+ $(,)?) => {
        $crate::template::Template::from_fmt(
            $fmt,
            ::std::vec![$($crate::template::Dynamic::from($value)),+],
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html;
    use proptest::prelude::*;
    use serde_json::json;

    fn to_json(t: &Template) -> serde_json::Value {
        serde_json::to_value(t.to_parts()).unwrap()
    }

    #[test]
    fn test_counter_lowering() {
        let t = html!("<div>{}</div>", 0);
        assert_eq!(to_json(&t), json!({"0": "0", "s": ["<div>", "</div>"]}));
    }

    #[test]
    fn test_static_only_template() {
        let t = html!("<hr/>");
        assert_eq!(to_json(&t), json!({"s": ["<hr/>"]}));
    }

    #[test]
    #[should_panic(expected = "one more literal fragment")]
    fn test_arity_violation_panics() {
        let _ = Template::new(vec!["a", "b"], vec![]);
    }

    #[test]
    fn test_scalar_is_escaped() {
        let t = html!("<p>{}</p>", "<b>bold</b>");
        assert_eq!(t.to_parts().get(0), Some(&Part::from("&lt;b&gt;bold&lt;/b&gt;")));
    }

    #[test]
    fn test_single_fragment_nested_is_flattened() {
        let t = html!("<p>{}</p>", Template::raw("<b>safe</b>"));
        assert_eq!(t.to_parts().get(0), Some(&Part::from("<b>safe</b>")));
    }

    #[test]
    fn test_nested_template_embeds_tree() {
        let t = html!("<p>{}</p>", html!("<i>{}</i>", "x"));
        assert_eq!(
            to_json(&t),
            json!({"0": {"0": "x", "s": ["<i>", "</i>"]}, "s": ["<p>", "</p>"]})
        );
    }

    #[test]
    fn test_placeholder_emits_handle() {
        let t = Template::new(vec!["<div>", "</div>"], vec![Dynamic::Placeholder(7)]);
        assert_eq!(to_json(&t), json!({"0": 7, "s": ["<div>", "</div>"]}));
    }

    #[test]
    fn test_uniform_list_lowering() {
        let rows: Vec<Template> = (0..3).map(|_| html!("<li>{}</li>", "a")).collect();
        let t = html!("<ul>{}</ul>", rows);
        assert_eq!(
            to_json(&t),
            json!({
                "0": {"d": [["a"], ["a"], ["a"]], "s": ["<li>", "</li>"]},
                "s": ["<ul>", "</ul>"]
            })
        );
    }

    #[test]
    fn test_placeholder_list_omits_statics() {
        let items = vec![Dynamic::Placeholder(1), Dynamic::Placeholder(2)];
        let t = html!("<ul>{}</ul>", items);
        assert_eq!(to_json(&t)["0"], json!({"d": [[1], [2]]}));
    }

    #[test]
    fn test_empty_list_is_empty_string() {
        let t = html!("<ul>{}</ul>", Vec::<Template>::new());
        assert_eq!(t.to_parts().get(0), Some(&Part::from("")));
    }

    #[test]
    fn test_scalar_list_is_flattened() {
        let items: Vec<Dynamic> = vec!["a".into(), "<b>".into()];
        let t = html!("{}", items);
        assert_eq!(t.to_parts().get(0), Some(&Part::from("a&lt;b&gt;")));
    }

    #[test]
    fn test_unresolved_component_lowered_empty() {
        let t = html!("{}", Dynamic::Component(ComponentRef::new("Widget", 5u8)));
        assert_eq!(t.to_parts().get(0), Some(&Part::from("")));
    }

    #[test]
    fn test_option_values() {
        let none: Option<&str> = None;
        let t = html!("{}|{}", none, Some(4));
        assert_eq!(t.to_string(), "|4");
    }

    #[test]
    fn test_display_concatenates() {
        let t = html!(
            "<ul>{}</ul><p>{}</p>",
            vec![html!("<li>{}</li>", 1), html!("<li>{}</li>", 2)],
            "a & b"
        );
        assert_eq!(t.to_string(), "<ul><li>1</li><li>2</li></ul><p>a &amp; b</p>");
    }

    #[test]
    fn test_join_with_separator() {
        let t = Template::join(vec![html!("{}", "a"), html!("{}", "b"), html!("{}", "c")], ", ");
        assert_eq!(t.to_string(), "a, b, c");
        assert_eq!(Template::join(vec![], ",").to_string(), "");
    }

    #[test]
    fn test_slot_count_matches_statics() {
        let t = html!("{}-{}-{}", 1, html!("<i>{}</i>", 2), "three");
        let parts = t.to_parts();
        assert_eq!(parts.statics.as_ref().map(Vec::len), Some(t.dynamics().len() + 1));
        assert_eq!(parts.slots.len(), 3);
    }

    fn template(values: &[String]) -> Template {
        let statics: Vec<String> = (0..=values.len()).map(|i| format!("<i{i}>")).collect();
        Template::new(statics, values.iter().map(|v| Dynamic::from(v.as_str())).collect())
    }

    proptest! {
        #[test]
        fn prop_lowering_keeps_one_more_fragment(values in proptest::collection::vec("[a-z<&]{0,3}", 0..6)) {
            let parts = template(&values).to_parts();
            prop_assert_eq!(parts.statics.map(|s| s.len()), Some(values.len() + 1));
            prop_assert_eq!(parts.slots.len(), values.len());
        }

        #[test]
        fn prop_list_rows_share_head_fragments(
            width in 1usize..4,
            height in 1usize..5,
            value in "[a-z]{0,2}",
        ) {
            let rows: Vec<Template> = (0..height).map(|_| template(&vec![value.clone(); width])).collect();
            let parts = html!("<ul>{}</ul>", rows).to_parts();
            let Some(Part::Tree(list)) = parts.get(0) else {
                panic!("expected a list tree");
            };
            prop_assert_eq!(list.statics.as_ref().map(Vec::len), Some(width + 1));
            let list_rows = list.rows.as_ref().map(Vec::as_slice).unwrap_or_default();
            prop_assert_eq!(list_rows.len(), height);
            prop_assert!(list_rows.iter().all(|row| row.len() == width));
        }
    }
}
