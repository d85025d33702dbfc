//! Configuration sourced from a KDL document
//!
//! ```kdl
//! service {
//!     name "weir-demo"
//!     max-attempts 5
//!     delays-after-failure "100ms" "800ms" "2s"
//!     max-pending-requests 512
//!     early-processing-grace "10ms"
//! }
//! rate-limit {
//!     bucket-size 4
//!     refill-qty 2
//!     refill-interval "100ms"
//! }
//! threads {
//!     workers min=2 max=8
//!     delay-queue 2
//! }
//! ```
//!
//! Every section is optional; omitted settings keep their defaults.

use std::collections::HashSet;
use std::time::Duration;

use kdl::{KdlDocument, KdlEntry, KdlNode};
use miette::{Diagnostic, SourceSpan};

use crate::config::{flat::parse_duration, internal::Config};

#[cfg(test)]
mod test;
mod utils;

/// This is the primary interface for parsing the document.
impl TryFrom<KdlDocument> for Config {
    type Error = miette::Error;

    fn try_from(value: KdlDocument) -> Result<Self, Self::Error> {
        let mut config = Config::default();

        // Visit the top level nodes, and make sure each section only
        // appears once. This is used to detect duplicate sections.
        let mut fingerprint_set: HashSet<&str> = HashSet::new();
        for node in value.nodes() {
            let name = node.name().value();
            let dupe = !fingerprint_set.insert(name);
            if dupe {
                return Err(Bad::docspan(
                    format!("Duplicate section: '{name}'!"),
                    &value,
                    node.span(),
                )
                .into());
            }

            match name {
                "service" => extract_service(&value, node, &mut config)?,
                "rate-limit" => extract_rate_limit(&value, node, &mut config)?,
                "threads" => extract_threads(&value, node, &mut config)?,
                other => {
                    return Err(Bad::docspan(
                        format!("Unknown configuration section: '{other}'"),
                        &value,
                        node.span(),
                    )
                    .into());
                }
            }
        }

        Ok(config)
    }
}

/// Extracts the `service` section: identity, retry schedule, admission bounds
fn extract_service(doc: &KdlDocument, node: &KdlNode, config: &mut Config) -> miette::Result<()> {
    let children = node
        .children()
        .or_bail("'service' should be a nested block", doc, node.span())?;

    for (node, name, args) in utils::data_nodes(doc, children)? {
        match name {
            "name" => {
                config.service_name =
                    utils::extract_one_str_arg(doc, node, name, args, |s| Some(s.to_string()))?;
            }
            "max-attempts" => {
                let val = utils::extract_one_int_arg(doc, node, name, args)?;
                config.max_attempts = u32::try_from(val).ok().or_bail(
                    "'max-attempts' should fit in a u32",
                    doc,
                    node.span(),
                )?;
            }
            "delays-after-failure" => {
                let vals = utils::str_args(doc, args)?;
                if vals.is_empty() {
                    return Err(Bad::docspan(
                        "'delays-after-failure' requires at least one duration",
                        doc,
                        node.span(),
                    )
                    .into());
                }
                config.delays_after_failure = vals
                    .into_iter()
                    .map(|v| extract_duration(doc, node, v))
                    .collect::<miette::Result<Vec<Duration>>>()?;
            }
            "max-pending-requests" => {
                config.max_pending_requests = utils::extract_one_int_arg(doc, node, name, args)?;
            }
            "early-processing-grace" => {
                let val = utils::extract_one_str_arg(doc, node, name, args, |s| Some(s.to_string()))?;
                config.early_processing_grace = extract_duration(doc, node, &val)?;
            }
            other => {
                return Err(
                    Bad::docspan(format!("Unknown setting: '{other}'"), doc, node.span()).into(),
                );
            }
        }
    }
    Ok(())
}

/// Extracts the `rate-limit` section: ticket bucket sizing
fn extract_rate_limit(
    doc: &KdlDocument,
    node: &KdlNode,
    config: &mut Config,
) -> miette::Result<()> {
    let children = node
        .children()
        .or_bail("'rate-limit' should be a nested block", doc, node.span())?;

    for (node, name, args) in utils::data_nodes(doc, children)? {
        match name {
            "bucket-size" => {
                config.bucket_size = utils::extract_one_int_arg(doc, node, name, args)?;
            }
            "refill-qty" => {
                config.refill_qty = utils::extract_one_int_arg(doc, node, name, args)?;
            }
            "refill-interval" => {
                let val = utils::extract_one_str_arg(doc, node, name, args, |s| Some(s.to_string()))?;
                config.refill_interval = extract_duration(doc, node, &val)?;
            }
            other => {
                return Err(
                    Bad::docspan(format!("Unknown setting: '{other}'"), doc, node.span()).into(),
                );
            }
        }
    }
    Ok(())
}

/// Extracts the `threads` section: worker pool bounds and delay queue shards
fn extract_threads(doc: &KdlDocument, node: &KdlNode, config: &mut Config) -> miette::Result<()> {
    let children = node
        .children()
        .or_bail("'threads' should be a nested block", doc, node.span())?;

    for (node, name, args) in utils::data_nodes(doc, children)? {
        match name {
            "workers" => {
                let (min, max) = extract_worker_bounds(doc, node, args)?;
                config.min_workers = min;
                config.max_workers = max;
            }
            "delay-queue" => {
                config.delay_queue_shards = utils::extract_one_int_arg(doc, node, name, args)?;
            }
            other => {
                return Err(
                    Bad::docspan(format!("Unknown setting: '{other}'"), doc, node.span()).into(),
                );
            }
        }
    }
    Ok(())
}

// workers min=2 max=8
fn extract_worker_bounds(
    doc: &KdlDocument,
    node: &KdlNode,
    args: &[KdlEntry],
) -> miette::Result<(usize, usize)> {
    let mut min: Option<usize> = None;
    let mut max: Option<usize> = None;

    for (name, entry) in utils::str_value_args(doc, args)? {
        let val = entry
            .value()
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .or_bail(
                format!("'{name}' should have a positive integer value"),
                doc,
                entry.span(),
            )?;
        match name {
            "min" => min = Some(val),
            "max" => max = Some(val),
            other => {
                return Err(
                    Bad::docspan(format!("Unknown key: '{other}'"), doc, entry.span()).into(),
                );
            }
        }
    }

    match (min, max) {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(Bad::docspan(
            "'workers' requires both 'min' and 'max'",
            doc,
            node.span(),
        )
        .into()),
    }
}

fn extract_duration(doc: &KdlDocument, node: &KdlNode, val: &str) -> miette::Result<Duration> {
    parse_duration(val)
        .map_err(|reason| Bad::docspan(reason, doc, node.span()).into())
}

#[derive(thiserror::Error, Debug, Diagnostic)]
#[error("Incorrect configuration contents")]
struct Bad {
    #[help]
    error: String,

    #[source_code]
    src: String,

    #[label("incorrect")]
    err_span: SourceSpan,
}

trait OptExtParse {
    type Good;

    fn or_bail(
        self,
        msg: impl Into<String>,
        doc: &KdlDocument,
        span: &SourceSpan,
    ) -> miette::Result<Self::Good>;
}

impl<T> OptExtParse for Option<T> {
    type Good = T;

    fn or_bail(
        self,
        msg: impl Into<String>,
        doc: &KdlDocument,
        span: &SourceSpan,
    ) -> miette::Result<Self::Good> {
        match self {
            Some(t) => Ok(t),
            None => Err(Bad::docspan(msg, doc, span).into()),
        }
    }
}

impl Bad {
    /// Helper function for creating a miette span from a given error
    fn docspan(msg: impl Into<String>, doc: &KdlDocument, span: &SourceSpan) -> Self {
        Self {
            error: msg.into(),
            src: doc.to_string(),
            err_span: span.to_owned(),
        }
    }
}
