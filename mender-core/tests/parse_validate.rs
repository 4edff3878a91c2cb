use mender_core::{
    parse_plan_str, validate_plan, DocumentFormat, Effect, Payload, Step, StepStatus, Validate,
    DEFAULT_INTERPRETER,
};

#[test]
fn parses_yaml_document_with_defaults() {
    let doc = r#"
name: setup
steps:
  - number: 1
    description: print a greeting
    command: ["echo", "hello"]
  - number: 2
    description: write a note
    code: |
      print("hi")
    depends_on: [1]
    effect:
      kind: create_file
      path: /tmp/note.txt
"#;
    let parsed = parse_plan_str(doc, DocumentFormat::Auto).unwrap();
    assert_eq!(parsed.format, DocumentFormat::Yaml);
    let plan = parsed.document;
    assert_eq!(plan.name.as_deref(), Some("setup"));
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].max_retries, 3);
    assert_eq!(plan.steps[0].timeout_seconds, 30);
    assert_eq!(plan.steps[1].status, StepStatus::Pending);
    assert!(matches!(
        plan.steps[1].effect,
        Some(Effect::CreateFile { ref path, .. }) if path == "/tmp/note.txt"
    ));
    assert!(plan.validate().is_ok());
}

#[test]
fn parses_bare_json_step_list() {
    let doc = r#"[
        {"number": 1, "description": "a", "command": ["true"]},
        {"number": 2, "description": "b", "command": ["true"], "dependencies": [1]}
    ]"#;
    let parsed = parse_plan_str(doc, DocumentFormat::Auto).unwrap();
    assert_eq!(parsed.format, DocumentFormat::Json);
    assert_eq!(parsed.document.steps[1].depends_on, vec![1]);
    assert!(validate_plan(&parsed.document).is_ok());
}

#[test]
fn rejects_dependency_on_later_step() {
    let doc = r#"
steps:
  - { number: 1, description: one, command: ["true"] }
  - { number: 2, description: two, command: ["true"] }
  - { number: 3, description: three, command: ["true"], depends_on: [5] }
  - { number: 4, description: four, command: ["true"] }
  - { number: 5, description: five, command: ["true"] }
"#;
    let plan = parse_plan_str(doc, DocumentFormat::Yaml).unwrap().document;
    let err = validate_plan(&plan).unwrap_err();
    assert_eq!(err.violations.len(), 1);
    assert_eq!(err.violations[0].path, "steps[2].depends_on[0]");
    assert!(err.violations[0].message.contains("earlier steps"));
}

#[test]
fn rejects_self_dependency_and_unknown_dependency() {
    let doc = r#"
steps:
  - { number: 2, description: one, command: ["true"], depends_on: [2] }
  - { number: 4, description: two, command: ["true"], depends_on: [3] }
"#;
    let plan = parse_plan_str(doc, DocumentFormat::Yaml).unwrap().document;
    let messages = validate_plan(&plan).unwrap_err().messages();
    assert!(messages.iter().any(|m| m.contains("cannot depend on step 2")));
    assert!(messages.iter().any(|m| m.contains("unknown step 3")));
}

#[test]
fn rejects_duplicate_and_decreasing_numbers() {
    let doc = r#"
steps:
  - { number: 1, description: a, command: ["true"] }
  - { number: 3, description: b, command: ["true"] }
  - { number: 3, description: c, command: ["true"] }
  - { number: 2, description: d, command: ["true"] }
"#;
    let plan = parse_plan_str(doc, DocumentFormat::Yaml).unwrap().document;
    let messages = validate_plan(&plan).unwrap_err().messages();
    assert!(messages.iter().any(|m| m.contains("duplicate step number 3")));
    assert!(messages.iter().any(|m| m.contains("strictly increasing")));
}

#[test]
fn rejects_bad_patterns_payloads_and_params() {
    let doc = r#"
steps:
  - number: 1
    description: both payloads
    code: print(1)
    command: ["true"]
  - number: 2
    description: bad regex
    command: ["echo", "{$params.missing}"]
    expected_output: "([unclosed"
  - number: 3
    description: zero timeout
    command: ["true"]
    timeout_seconds: 0
"#;
    let plan = parse_plan_str(doc, DocumentFormat::Yaml).unwrap().document;
    let messages = validate_plan(&plan).unwrap_err().messages();
    assert!(messages.iter().any(|m| m.starts_with("steps[0]: at most one of code, command")));
    assert!(messages.iter().any(|m| m.starts_with("steps[1].expected_output: invalid regular expression")));
    assert!(messages.iter().any(|m| m.contains("unknown parameter `missing`")));
    assert!(messages.iter().any(|m| m.starts_with("steps[2].timeout_seconds")));
}

#[test]
fn effect_builtin_params_satisfy_templates() {
    let doc = r#"
steps:
  - number: 1
    description: touch the target
    command: ["touch", "{$params.target_path}"]
    effect:
      kind: create_file
      path: "{$params.dir}/out.txt"
    params:
      dir: /tmp
"#;
    let plan = parse_plan_str(doc, DocumentFormat::Yaml).unwrap().document;
    assert!(validate_plan(&plan).is_ok());
}

#[test]
fn empty_plan_is_rejected() {
    let plan = parse_plan_str("steps: []", DocumentFormat::Yaml).unwrap().document;
    let err = validate_plan(&plan).unwrap_err();
    assert_eq!(err.violations[0].path, "steps");
}

#[test]
fn garbage_input_fails_to_parse() {
    assert!(parse_plan_str("invalid: yaml: content", DocumentFormat::Auto).is_err());
    assert!(parse_plan_str("   ", DocumentFormat::Auto).is_err());
}

#[test]
fn code_without_interpreter_takes_the_given_default() {
    let mut step = Step::new(1, "print a greeting");
    step.code = Some("echo hi".to_string());
    assert_eq!(
        step.payload_with("sh"),
        Some(Payload::Code {
            source: "echo hi".to_string(),
            interpreter: "sh".to_string(),
        })
    );
    assert_eq!(step.payload().unwrap().program(), DEFAULT_INTERPRETER);

    step.interpreter = Some("bash".to_string());
    assert_eq!(step.payload_with("sh").unwrap().program(), "bash");
}
