//! Various ad-hoc KDL document parsers used

use super::OptExtParse;
use kdl::{KdlDocument, KdlEntry, KdlNode};

/// Get 0..N children nodes with their names and arguments
///
/// For example: all the settings inside the `service` block
pub(crate) fn data_nodes<'a>(
    _doc: &KdlDocument,
    here: &'a KdlDocument,
) -> miette::Result<Vec<(&'a KdlNode, &'a str, &'a [KdlEntry])>> {
    let mut out = vec![];
    for node in here.nodes() {
        out.push((node, node.name().value(), node.entries()));
    }
    Ok(out)
}

/// Collect all arguments as unnamed string values
///
/// `delays-after-failure "100ms" "800ms"` yields `["100ms", "800ms"]`
pub(crate) fn str_args<'a>(
    doc: &KdlDocument,
    args: &'a [KdlEntry],
) -> miette::Result<Vec<&'a str>> {
    let mut out = vec![];
    for arg in args {
        let val = arg
            .value()
            .as_string()
            .or_bail("arg values should be a string", doc, arg.span())?;
        out.push(val);
    }
    Ok(out)
}

/// Collect all arguments as named `key=value` pairs, keeping the raw entry
///
/// `workers min=2 max=8` yields `[("min", ...), ("max", ...)]`
pub(crate) fn str_value_args<'a>(
    doc: &KdlDocument,
    args: &'a [KdlEntry],
) -> miette::Result<Vec<(&'a str, &'a KdlEntry)>> {
    let mut out = vec![];
    for arg in args {
        let name = arg
            .name()
            .map(|a| a.value())
            .or_bail("arguments should be named", doc, arg.span())?;
        out.push((name, arg));
    }
    Ok(out)
}

/// Extract a single un-named string argument, like `name "weir-demo"`
pub(crate) fn extract_one_str_arg<T, F: FnOnce(&str) -> Option<T>>(
    doc: &KdlDocument,
    node: &KdlNode,
    name: &str,
    args: &[KdlEntry],
    f: F,
) -> miette::Result<T> {
    match args {
        [one] => one.value().as_string().and_then(f),
        _ => None,
    }
    .or_bail(format!("Incorrect argument for '{name}'"), doc, node.span())
}

/// Extract a single un-named non-negative integer argument, like
/// `max-attempts 3`
pub(crate) fn extract_one_int_arg(
    doc: &KdlDocument,
    node: &KdlNode,
    name: &str,
    args: &[KdlEntry],
) -> miette::Result<usize> {
    match args {
        [one] => one.value().as_i64().and_then(|v| usize::try_from(v).ok()),
        _ => None,
    }
    .or_bail(
        format!("'{name}' should have a positive integer value"),
        doc,
        node.span(),
    )
}
