use azure_cli_mcp::audit;
use azure_cli_mcp::config::PolicyConfig;
use azure_cli_mcp::tools::{CommandPolicy, CommandValidator};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn validator() -> CommandValidator {
    let config = PolicyConfig {
        denied_commands: vec![
            "group delete".to_string(),
            "* delete".to_string(),
            "keyvault purge".to_string(),
        ],
        forbidden_commands: vec!["ad sp credential reset".to_string()],
        ..PolicyConfig::default()
    };
    CommandValidator::new(CommandPolicy::from_config(&config).unwrap(), "az")
}

fn bench_validate(c: &mut Criterion) {
    let validator = validator();

    c.bench_function("validate_allowed", |b| {
        b.iter(|| {
            validator.validate(
                black_box("az vm list --resource-group my-rg --query \"[].name\" --output json"),
                false,
            )
        })
    });

    c.bench_function("validate_rejected_metachar", |b| {
        b.iter(|| validator.validate(black_box("group list; rm -rf /"), false))
    });

    c.bench_function("validate_denied", |b| {
        b.iter(|| validator.validate(black_box("group delete --name rg --yes"), false))
    });
}

fn bench_redact(c: &mut Criterion) {
    c.bench_function("redact_command", |b| {
        b.iter(|| {
            audit::redact_command(black_box(
                "login --service-principal -u app -p s3cret --tenant t SAS_TOKEN=abc",
            ))
        })
    });
}

criterion_group!(benches, bench_validate, bench_redact);
criterion_main!(benches);
