use mender_core::{ActionCategory, Effect, Params, Step};

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn effect_fields_render_against_params() {
    let effect = Effect::CreateFile {
        path: "{$params.dir}/report.txt".to_string(),
        content: Some("total={$params.total}".to_string()),
        alternative_locations: vec!["/tmp".to_string()],
    };
    let rendered = effect
        .render(&params(&[("dir", "/srv/out"), ("total", "42")]))
        .unwrap();
    assert_eq!(
        rendered,
        Effect::CreateFile {
            path: "/srv/out/report.txt".to_string(),
            content: Some("total=42".to_string()),
            alternative_locations: vec!["/tmp".to_string()],
        }
    );
    assert!(effect.render(&Params::new()).is_err());
}

#[test]
fn effects_map_to_categories_and_target_params() {
    let launch = Effect::LaunchApplication {
        application: "firefox".to_string(),
        alternatives: vec![],
    };
    assert_eq!(launch.category(), ActionCategory::ApplicationLaunch);
    assert_eq!(launch.target_param(), Some("application"));

    let delete = Effect::DeleteFile {
        path: "/tmp/x".to_string(),
    };
    assert_eq!(delete.category().as_str(), "file_system");
    assert_eq!(delete.target_param(), Some("target_path"));

    let output = Effect::Output {
        pattern: "done".to_string(),
    };
    assert_eq!(output.category(), ActionCategory::Output);
    assert_eq!(output.target_param(), None);
}

#[test]
fn resolved_params_prefer_explicit_values() {
    let mut step = Step::new(1, "type a greeting");
    step.effect = Some(Effect::TypeText {
        text: "hello {$params.name}".to_string(),
        methods: vec!["clipboard".to_string()],
    });
    step.params = params(&[("name", "world")]);

    let resolved = step.resolved_params().unwrap();
    assert_eq!(resolved["text"], "hello world");
    assert_eq!(resolved["input_method"], "clipboard");
    assert_eq!(resolved["name"], "world");

    step.params.insert("input_method".to_string(), "keyboard".to_string());
    assert_eq!(step.resolved_params().unwrap()["input_method"], "keyboard");
}

#[test]
fn launch_effect_defaults_to_direct_method() {
    let mut step = Step::new(1, "open the browser");
    step.effect = Some(Effect::LaunchApplication {
        application: "firefox".to_string(),
        alternatives: vec![],
    });
    let resolved = step.resolved_params().unwrap();
    assert_eq!(resolved["application"], "firefox");
    assert_eq!(resolved["launch_method"], "direct");
}

#[test]
fn effect_is_a_tagged_object() {
    let yaml = "kind: create_directory\npath: /tmp/out\n";
    let effect: Effect = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
        effect,
        Effect::CreateDirectory {
            path: "/tmp/out".to_string(),
            alternative_locations: vec![],
        }
    );
    assert_eq!(effect.kind(), "create_directory");
}
