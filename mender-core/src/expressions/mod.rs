mod template;

pub use template::{parse_template, render_str, Segment, Template, TemplateError};
