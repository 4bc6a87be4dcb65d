//! Collection of the service selectors, on each scrape.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, NoLabelSet},
    metrics::MetricType,
};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::{
    inventory::{self, ScopedFetchError, Service, ServiceSource},
    labels::resolve_labels,
};

pub const METRIC_NAME: &str = "kube_service_selectors";
pub const DESCRIPTION: &str = "Kubernetes services selectors";

/// Labels that identify the service, always at the end of the label set.
pub const IDENTITY_LABELS: [&str; 3] = ["service", "namespace", "uid"];

/// What to list, and how.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Namespaces to list, all of them if empty.
    pub namespaces: Vec<String>,
    /// Maximum number of services per request.
    pub page_size: u32,
    /// Timeout of each request.
    pub timeout: Duration,
}

/// The labels of one service: its selector first, then its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    names: Vec<String>,
    values: Vec<String>,
}

#[derive(Debug, Error)]
#[error("label {label:?} appears twice for service {namespace}/{service}")]
pub struct TransformError {
    pub service: String,
    pub namespace: String,
    pub label: String,
}

impl LabelSet {
    pub fn for_service(service: &Service) -> Result<Self, TransformError> {
        let (mut names, mut values) = resolve_labels(&service.selector);
        names.extend(IDENTITY_LABELS.iter().map(|l| l.to_string()));
        values.extend([service.name.clone(), service.namespace.clone(), service.uid.clone()]);

        let mut seen = FxHashSet::default();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(TransformError {
                service: service.name.clone(),
                namespace: service.namespace.clone(),
                label: dup.to_owned(),
            });
        }
        Ok(Self { names, values })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Samples that share the same label names, in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGroup {
    pub label_names: Vec<String>,
    /// Label values of each sample, aligned with `label_names`.
    pub samples: Vec<Vec<String>>,
}

/// Snapshot of the gauge `kube_service_selectors`: one sample of value 1 per service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GaugeFamily {
    /// In order of first appearance.
    pub groups: Vec<SampleGroup>,
}

impl GaugeFamily {
    /// Groups the label sets by label names.
    pub fn from_label_sets(label_sets: impl IntoIterator<Item = LabelSet>) -> Self {
        let mut groups: Vec<SampleGroup> = Vec::new();
        let mut index: FxHashMap<Vec<String>, usize> = FxHashMap::default();
        for set in label_sets {
            match index.get(&set.names) {
                Some(&i) => groups[i].samples.push(set.values),
                None => {
                    index.insert(set.names.clone(), groups.len());
                    groups.push(SampleGroup {
                        label_names: set.names,
                        samples: vec![set.values],
                    });
                }
            }
        }
        Self { groups }
    }

    pub fn sample_count(&self) -> usize {
        self.groups.iter().map(|g| g.samples.len()).sum()
    }

    /// Iterates on the `(name, value)` pairs of each sample.
    pub fn samples(&self) -> impl Iterator<Item = Vec<(String, String)>> + '_ {
        self.groups.iter().flat_map(|g| {
            g.samples
                .iter()
                .map(|values| g.label_names.iter().cloned().zip(values.iter().cloned()).collect())
        })
    }
}

/// Number of successful and failed collections since the start of the process.
///
/// Created once and shared with the collector. Never reset.
#[derive(Debug, Default)]
pub struct Outcomes {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutcomeCounts {
    pub succeeded: u64,
    pub failed: u64,
}

impl Outcomes {
    /// Counts one more collection, and returns the new values of both counters.
    pub fn record(&self, success: bool) -> OutcomeCounts {
        if success {
            OutcomeCounts {
                succeeded: self.succeeded.fetch_add(1, Ordering::Relaxed) + 1,
                failed: self.failed.load(Ordering::Relaxed),
            }
        } else {
            OutcomeCounts {
                succeeded: self.succeeded.load(Ordering::Relaxed),
                failed: self.failed.fetch_add(1, Ordering::Relaxed) + 1,
            }
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] ScopedFetchError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// A metric family produced by one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricFamily {
    Gauge(GaugeFamily),
    /// The `{METRIC_NAME}_total` counter, with one sample per result.
    ///
    /// Its family is described under [`METRIC_NAME`], like the gauge, so the exposition
    /// has two families named `kube_service_selectors`. Strict OpenMetrics parsers
    /// reject such a scrape.
    Outcomes(OutcomeCounts),
}

/// Exposes the selectors of the services as the labels of a gauge.
///
/// Every scrape lists the services again: see [`SelectorsCollector::collect`].
#[derive(Debug)]
pub struct SelectorsCollector<S> {
    source: S,
    settings: FetchSettings,
    outcomes: Arc<Outcomes>,
}

impl<S: ServiceSource> SelectorsCollector<S> {
    pub fn new(source: S, settings: FetchSettings, outcomes: Arc<Outcomes>) -> Self {
        Self {
            source,
            settings,
            outcomes,
        }
    }

    /// Lists the services and turns them into a gauge family.
    ///
    /// Does not touch the outcome counters.
    pub fn run_cycle(&self) -> Result<GaugeFamily, CollectError> {
        let s = &self.settings;
        let services = inventory::fetch_all(&self.source, &s.namespaces, s.page_size, s.timeout)?;
        let label_sets = services
            .iter()
            .map(LabelSet::for_service)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GaugeFamily::from_label_sets(label_sets))
    }

    /// Runs one collection and returns the families to expose.
    ///
    /// On success: the gauge, then the outcome counter. On failure, only the counter:
    /// a partial list of services would look like services have been deleted.
    pub fn collect(&self) -> Vec<MetricFamily> {
        match self.run_cycle() {
            Ok(gauge) => {
                log::debug!("collected {} services", gauge.sample_count());
                let counts = self.outcomes.record(true);
                vec![MetricFamily::Gauge(gauge), MetricFamily::Outcomes(counts)]
            }
            Err(e) => {
                let e = anyhow::Error::new(e);
                log::error!("Error while collecting {METRIC_NAME}: {e:#}");
                let counts = self.outcomes.record(false);
                vec![MetricFamily::Outcomes(counts)]
            }
        }
    }
}

impl MetricFamily {
    fn encode(&self, encoder: &mut DescriptorEncoder) -> Result<(), fmt::Error> {
        match self {
            MetricFamily::Gauge(gauge) => {
                let mut metric_encoder = encoder.encode_descriptor(METRIC_NAME, DESCRIPTION, None, MetricType::Gauge)?;
                for labels in gauge.samples() {
                    metric_encoder.encode_family(&labels)?.encode_gauge(&1i64)?;
                }
            }
            MetricFamily::Outcomes(counts) => {
                // the counter encoder appends `_total` to the name
                let help = format!("{DESCRIPTION} collector workflow result");
                let mut metric_encoder = encoder.encode_descriptor(METRIC_NAME, &help, None, MetricType::Counter)?;
                for (result, count) in [("succeeded", counts.succeeded), ("failed", counts.failed)] {
                    let labels = vec![(String::from("result"), String::from(result))];
                    metric_encoder
                        .encode_family(&labels)?
                        .encode_counter::<NoLabelSet, _, f64>(&count, None)?;
                }
            }
        }
        Ok(())
    }
}

impl<S> Collector for SelectorsCollector<S>
where
    S: ServiceSource + fmt::Debug + Send + Sync + 'static,
{
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), fmt::Error> {
        for family in self.collect() {
            family.encode(&mut encoder)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use prometheus_client::{encoding::text::encode, registry::Registry};

    use super::*;
    use crate::inventory::{
        FetchError, ServicePage,
        tests::{ScriptedSource, page, service},
    };

    fn settings(namespaces: &[&str]) -> FetchSettings {
        FetchSettings {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            page_size: 1000,
            timeout: Duration::from_secs(10),
        }
    }

    fn collector(source: ScriptedSource) -> SelectorsCollector<ScriptedSource> {
        SelectorsCollector::new(source, settings(&[]), Arc::new(Outcomes::default()))
    }

    fn single_page(items: Vec<Service>) -> Result<ServicePage, FetchError> {
        Ok(ServicePage {
            items,
            next_cursor: None,
        })
    }

    #[test]
    fn no_services() {
        let c = collector(ScriptedSource::new().then(None, None, single_page(vec![])));
        assert_eq!(
            c.collect(),
            vec![
                MetricFamily::Gauge(GaugeFamily::default()),
                MetricFamily::Outcomes(OutcomeCounts {
                    succeeded: 1,
                    failed: 0
                }),
            ]
        );
    }

    #[test]
    fn identity_labels_are_last() {
        let svc = service(1, &[("app", "web"), ("Tier", "front")]);
        let set = LabelSet::for_service(&svc).unwrap();
        assert_eq!(set.names(), ["label_tier", "label_app", "service", "namespace", "uid"].map(String::from));
        assert_eq!(set.values(), ["front", "web", "name_1", "namespace_1", "uid_1"].map(String::from));

        let empty = LabelSet::for_service(&service(2, &[])).unwrap();
        assert_eq!(empty.names(), IDENTITY_LABELS.map(String::from));
        assert_eq!(empty.values(), ["name_2", "namespace_2", "uid_2"].map(String::from));
    }

    #[test]
    fn services_grouped_by_label_names() {
        let services = vec![
            service(0, &[("app", "a")]),
            service(1, &[("app", "b"), ("tier", "x")]),
            service(2, &[("app", "c")]),
            service(3, &[]),
        ];
        let c = collector(ScriptedSource::new().then(None, None, single_page(services)));
        let families = c.collect();
        let MetricFamily::Gauge(gauge) = &families[0] else {
            panic!("expected a gauge first, got {families:?}");
        };
        assert_eq!(gauge.sample_count(), 4);

        let names: Vec<_> = gauge.groups.iter().map(|g| g.label_names.join(",")).collect();
        assert_eq!(
            names,
            vec![
                "label_app,service,namespace,uid",
                "label_app,label_tier,service,namespace,uid",
                "service,namespace,uid",
            ]
        );
        assert_eq!(
            gauge.groups[0].samples,
            vec![
                vec!["a", "name_0", "namespace_0", "uid_0"],
                vec!["c", "name_2", "namespace_2", "uid_2"],
            ]
        );
    }

    #[test]
    fn two_pages_are_collected() {
        let source = ScriptedSource::new()
            .then(Some("default"), None, page(0..1000, Some("token")))
            .then(Some("default"), Some("token"), page(1000..2000, None));
        let c = SelectorsCollector::new(source, settings(&["default"]), Arc::new(Outcomes::default()));
        let gauge = c.run_cycle().unwrap();
        assert_eq!(gauge.sample_count(), 2000);
        for labels in gauge.samples() {
            assert_eq!(labels.len(), 4);
            assert!(labels[0].0.starts_with("label_"));
            assert_eq!(labels[1..].iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), IDENTITY_LABELS);
        }
    }

    #[test]
    fn failure_mid_pagination_exposes_only_the_counter() {
        let source = ScriptedSource::new()
            .then(None, None, page(0..1000, Some("token")))
            .then(None, Some("token"), Err(FetchError::MissingField("metadata.uid")));
        let c = collector(source);
        assert_eq!(
            c.collect(),
            vec![MetricFamily::Outcomes(OutcomeCounts {
                succeeded: 0,
                failed: 1
            })]
        );
    }

    #[test]
    fn duplicate_label_names_are_rejected() {
        let svc = service(1, &[("A", "1"), ("a", "2"), ("a_conflict1", "3")]);
        let err = LabelSet::for_service(&svc).unwrap_err();
        assert_eq!(err.label, "label_a_conflict1");
        assert_eq!(err.service, "name_1");
        assert_eq!(err.namespace, "namespace_1");
    }

    #[test]
    fn duplicate_label_names_fail_the_whole_cycle() {
        let services = vec![
            service(1, &[("A", "1"), ("a", "2"), ("a_conflict1", "3")]),
            service(2, &[("app", "web")]),
        ];
        let c = collector(ScriptedSource::new().then(None, None, single_page(services)));
        assert_eq!(
            c.collect(),
            vec![MetricFamily::Outcomes(OutcomeCounts {
                succeeded: 0,
                failed: 1
            })]
        );
    }

    #[test]
    fn outcomes_accumulate() {
        let outcomes = Arc::new(Outcomes::default());
        let source = ScriptedSource::new()
            .then(None, None, single_page(vec![service(0, &[])]))
            .then(None, None, Err(FetchError::MissingField("metadata.name")))
            .then(None, None, single_page(vec![]));
        let c = SelectorsCollector::new(source, settings(&[]), outcomes.clone());

        let expected = [(1, 0), (1, 1), (2, 1)];
        for (succeeded, failed) in expected {
            let families = c.collect();
            assert_eq!(
                families.last(),
                Some(&MetricFamily::Outcomes(OutcomeCounts { succeeded, failed }))
            );
        }
        assert_eq!(outcomes.counts(), OutcomeCounts { succeeded: 2, failed: 1 });
    }

    #[test]
    fn exposition() {
        let source = ScriptedSource::new()
            .then(
                None,
                None,
                single_page(vec![Service {
                    name: String::from("web"),
                    namespace: String::from("shop"),
                    uid: String::from("1234"),
                    selector: [("app.kubernetes.io/name", "web"), ("app_kubernetes_io_name", "api")]
                        .into_iter()
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .collect(),
                }]),
            )
            .then(None, None, Err(FetchError::MissingField("metadata.uid")));

        let mut registry = Registry::default();
        registry.register_collector(Box::new(collector(source)));

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(text.contains("# TYPE kube_service_selectors gauge"), "{text}");
        // the counter family shares the name of the gauge
        assert!(text.contains("# TYPE kube_service_selectors counter"), "{text}");
        assert!(
            text.contains(concat!(
                r#"kube_service_selectors{label_app_kubernetes_io_name_conflict1="web","#,
                r#"label_app_kubernetes_io_name_conflict2="api",service="web",namespace="shop",uid="1234"} 1"#
            )),
            "{text}"
        );
        assert!(text.contains(r#"kube_service_selectors_total{result="succeeded"} 1"#), "{text}");
        assert!(text.contains(r#"kube_service_selectors_total{result="failed"} 0"#), "{text}");

        // second scrape fails: no gauge, but the counter is still there
        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(!text.contains("# TYPE kube_service_selectors gauge"), "{text}");
        assert!(text.contains(r#"kube_service_selectors_total{result="succeeded"} 1"#), "{text}");
        assert!(text.contains(r#"kube_service_selectors_total{result="failed"} 1"#), "{text}");
    }
}
