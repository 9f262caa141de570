use anyhow::Result;

use crate::error::AppError;
use crate::xs::lriterator::{parse, RangeSpec};

#[test]
fn templates_expand_with_padding_and_step() -> Result<()> {
    let spec = parse("shard-{0008..0012}.bin")?;
    let tmpl = match spec {
        RangeSpec::Template(tmpl) => tmpl,
        other => anyhow::bail!("expected template, got {:?}", other),
    };
    let names: Vec<_> = tmpl.names().collect();
    assert_eq!(
        names,
        vec!["shard-0008.bin", "shard-0009.bin", "shard-0010.bin", "shard-0011.bin", "shard-0012.bin"],
        "unexpected expansion"
    );
    assert_eq!(tmpl.num_names(), 5, "unexpected template len");

    let stepped = match parse("{0..25..10}")? {
        RangeSpec::Template(tmpl) => tmpl,
        other => anyhow::bail!("expected template, got {:?}", other),
    };
    assert_eq!(stepped.names().collect::<Vec<_>>(), vec!["0", "10", "20"], "unexpected stepped expansion");
    assert_eq!(stepped.num_names(), 3, "unexpected stepped len");
    Ok(())
}

#[test]
fn huge_templates_are_counted_without_expanding() -> Result<()> {
    let tmpl = match parse("x-{0..18446744073709551615}")? {
        RangeSpec::Template(tmpl) => tmpl,
        other => anyhow::bail!("expected template, got {:?}", other),
    };
    assert_eq!(tmpl.num_names(), u64::MAX, "expected the name count to saturate");
    let first: Vec<_> = tmpl.names().take(3).collect();
    assert_eq!(first, vec!["x-0", "x-1", "x-2"], "expected names to be generated lazily");
    Ok(())
}

#[test]
fn names_without_braces_are_prefixes() -> Result<()> {
    assert_eq!(parse("logs/2021-")?, RangeSpec::Prefix("logs/2021-".into()), "expected prefix spec");
    assert_eq!(parse("")?, RangeSpec::Prefix("".into()), "expected empty prefix spec");
    Ok(())
}

#[test]
fn malformed_specs_are_rejected() {
    for raw in ["a-{1..}", "a-{..3}", "a-{3..1}", "a-{1..5..0}", "a-{x..3}", "a-{1..3", "a-1..3}", "a-}1..3{", "{1..2}-{3..4}", "a-{1}", "a-{-1..3}"] {
        let err = match parse(raw) {
            Ok(spec) => panic!("expected {} to be rejected, got {:?}", raw, spec),
            Err(err) => err,
        };
        assert!(
            matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
            "expected validation error for {}, got {:?}",
            raw,
            err
        );
    }
}
