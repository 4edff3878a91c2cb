use mender_core::expressions::{parse_template, render_str, Segment, TemplateError};
use mender_core::Params;

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn renders_params_and_keeps_other_braces() {
    let p = params(&[("target_path", "/tmp/a.txt")]);
    let out = render_str("echo ${HOME} > {$params.target_path}; d = {'k': 1}", &p).unwrap();
    assert_eq!(out, "echo ${HOME} > /tmp/a.txt; d = {'k': 1}");
}

#[test]
fn parses_segments() {
    let t = parse_template("open { $params.application } now").unwrap();
    assert_eq!(
        t.segments,
        vec![
            Segment::Literal("open ".into()),
            Segment::Param("application".into()),
            Segment::Literal(" now".into()),
        ]
    );
}

#[test]
fn reports_template_errors() {
    assert_eq!(
        parse_template("{$params.x").unwrap_err(),
        TemplateError::UnclosedExpression
    );
    assert!(matches!(
        parse_template("{$inputs.x}").unwrap_err(),
        TemplateError::InvalidExpression(_)
    ));
    assert_eq!(
        render_str("{$params.nope}", &Params::new()).unwrap_err(),
        TemplateError::UnknownParam("nope".into())
    );
}
