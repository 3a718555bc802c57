#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::uuid_like;
    use faro_core::config::{EngineConfig, NamespaceEntry, ResourceEntry, ResourceSelector, Scope};
    use faro_core::dispatch::subscriber;
    use faro_core::metrics::NoopMetricsSink;
    use faro_core::model::{EventKind, NormalizedEvent};
    use faro_core::Engine;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
    };
    use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
    use kube::core::ApiResource;
    use kube::{Client, ResourceExt};
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    type Events = Arc<Mutex<Vec<NormalizedEvent>>>;

    /// Starts an engine with `config` and one subscriber that accumulates
    /// every observed event, matching the S1-S6 scenarios' need to assert
    /// on the sequence a consumer actually saw.
    async fn collecting_engine(client: Client, config: EngineConfig) -> (Engine, Events) {
        let engine = Engine::new(client, config, Arc::new(NoopMetricsSink));
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        engine
            .add_subscriber(subscriber(move |event| {
                let events = events_clone.clone();
                async move {
                    events.lock().await.push(event);
                    Ok(())
                }
            }))
            .await;
        engine.start().await.expect("engine failed to start");
        (engine, events)
    }

    async fn wait_for_events(events: &Events, count: usize) -> Vec<NormalizedEvent> {
        timeout(Duration::from_secs(30), async {
            loop {
                {
                    let guard = events.lock().await;
                    if guard.len() >= count {
                        return guard.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .expect("timed out waiting for events")
    }

    fn kinds_for(events: &[NormalizedEvent], key: &str) -> Vec<EventKind> {
        events.iter().filter(|e| e.key() == key).map(|e| e.event_kind).collect()
    }

    fn resource_entry(gvr: &str, scope: Scope, namespaces: Vec<&str>) -> ResourceEntry {
        ResourceEntry {
            gvr: gvr.to_string(),
            scope,
            namespaces: namespaces.into_iter().map(String::from).collect(),
            name_selector: None,
            label_selector: None,
        }
    }

    /// S1 — namespace-scoped ConfigMap, label-filtered: create, patch,
    /// delete `cm/test-1` in `t3` and expect `ADDED, UPDATED, DELETED`.
    #[tokio::test]
    async fn s1_namespace_scoped_configmap_label_filtered() {
        let client = Client::try_default().await.unwrap();
        let mut resources = HashMap::new();
        resources.insert(
            "v1/configmaps".to_string(),
            ResourceSelector {
                name_selector: None,
                label_selector: Some("app=faro-test".into()),
            },
        );
        let config = EngineConfig {
            namespaces: vec![NamespaceEntry {
                namespace: "t3".into(),
                resources,
            }],
            ..Default::default()
        };
        let (engine, events) = collecting_engine(client.clone(), config).await;

        let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), "t3");
        let mut cm: ConfigMap = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "test-1", "labels": {"app": "faro-test"}},
            "data": {"k": "v1"},
        }))
        .unwrap();
        cm_api.create(&PostParams::default(), &cm).await.unwrap();

        cm.data.get_or_insert_with(Default::default).insert("k".into(), "v2".into());
        cm.managed_fields_mut().clear();
        cm_api
            .patch("test-1", &PatchParams::apply("faro-tests").force(), &Patch::Apply(&cm))
            .await
            .unwrap();

        cm_api.delete("test-1", &DeleteParams::default()).await.unwrap();

        let observed = wait_for_events(&events, 3).await;
        assert_eq!(
            kinds_for(&observed, "t3/test-1"),
            vec![EventKind::Added, EventKind::Updated, EventKind::Deleted]
        );
        for event in observed.iter().filter(|e| e.key() == "t3/test-1") {
            assert_eq!(event.gvr.canonical(), "v1/configmaps");
            assert_eq!(event.namespace.as_deref(), Some("t3"));
        }

        engine.stop().await;
    }

    /// S2 — cluster-scoped Namespace matching an exact name: create then
    /// delete `faro-test-5`, expecting `ADDED` (optionally `UPDATED`) and
    /// `DELETED`, never carrying a namespace.
    #[tokio::test]
    async fn s2_cluster_scoped_namespace_exact_name() {
        let client = Client::try_default().await.unwrap();
        let mut entry = resource_entry("v1/namespaces", Scope::Cluster, vec![]);
        entry.name_selector = Some("faro-test-5".into());
        let config = EngineConfig {
            resources: vec![entry],
            ..Default::default()
        };
        let (engine, events) = collecting_engine(client.clone(), config).await;

        let ns_api: Api<Namespace> = Api::all(client.clone());
        let ns: Namespace = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "faro-test-5"},
        }))
        .unwrap();
        ns_api.create(&PostParams::default(), &ns).await.unwrap();
        ns_api.delete("faro-test-5", &DeleteParams::default()).await.unwrap();

        let observed = wait_for_events(&events, 2).await;
        let kinds = kinds_for(&observed, "faro-test-5");
        assert_eq!(kinds.first(), Some(&EventKind::Added));
        assert_eq!(kinds.last(), Some(&EventKind::Deleted));
        for event in observed.iter().filter(|e| e.key() == "faro-test-5") {
            assert!(event.namespace.is_none());
        }

        engine.stop().await;
    }

    /// S3 — the same GVR watched across three namespaces: regression guard
    /// for the `"<gvr>@<namespace>"` lister key scheme, which
    /// replaced a prior single-lister-key-per-GVR bug.
    #[tokio::test]
    async fn s3_multi_namespace_same_gvr() {
        let client = Client::try_default().await.unwrap();
        let config = EngineConfig {
            resources: vec![resource_entry("batch/v1/jobs", Scope::Namespaced, vec!["a", "b", "c"])],
            ..Default::default()
        };
        let (engine, events) = collecting_engine(client.clone(), config).await;

        for ns in ["a", "b", "c"] {
            let job_api: Api<Job> = Api::namespaced(client.clone(), ns);
            let job: Job = serde_json::from_value(serde_json::json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": {"name": "faro-job"},
                "spec": {
                    "template": {
                        "spec": {
                            "containers": [{"name": "work", "image": "busybox", "command": ["true"]}],
                            "restartPolicy": "Never",
                        }
                    }
                },
            }))
            .unwrap();
            job_api.create(&PostParams::default(), &job).await.unwrap();
        }

        let observed = wait_for_events(&events, 3).await;
        for ns in ["a", "b", "c"] {
            let key = format!("{ns}/faro-job");
            assert_eq!(kinds_for(&observed, &key), vec![EventKind::Added], "missing ADDED for {key}");
        }

        for ns in ["a", "b", "c"] {
            let job_api: Api<Job> = Api::namespaced(client.clone(), ns);
            job_api
                .delete("faro-job", &DeleteParams::background())
                .await
                .unwrap();
        }
        let observed = wait_for_events(&events, 6).await;
        for ns in ["a", "b", "c"] {
            let key = format!("{ns}/faro-job");
            assert!(kinds_for(&observed, &key).contains(&EventKind::Deleted), "missing DELETED for {key}");
        }

        engine.stop().await;
    }

    /// S4 — a CRD appearing after `Start`: no informer exists for
    /// `example.com/v1/widgets` until the CRD is installed, at which point
    /// the CRD Adapter must start one and deliver `ADDED w1`.
    #[tokio::test]
    async fn s4_crd_appearing_after_start() {
        let client = Client::try_default().await.unwrap();
        let config = EngineConfig {
            resources: vec![resource_entry("example.com/v1/widgets", Scope::Namespaced, vec!["default"])],
            ..Default::default()
        };
        let (engine, events) = collecting_engine(client.clone(), config).await;

        let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
        let crd: CustomResourceDefinition = CustomResourceDefinition {
            metadata: kube::api::ObjectMeta {
                name: Some("widgets.example.com".into()),
                ..Default::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: "example.com".into(),
                names: CustomResourceDefinitionNames {
                    plural: "widgets".into(),
                    singular: Some("widget".into()),
                    kind: "Widget".into(),
                    ..Default::default()
                },
                scope: "Namespaced".into(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: "v1".into(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        open_api_v3_schema: Some(JSONSchemaProps {
                            type_: Some("object".into()),
                            x_kubernetes_preserve_unknown_fields: Some(true),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        };
        crd_api.create(&PostParams::default(), &crd).await.unwrap();

        // Wait for the CRD to become established before creating an instance.
        tokio::time::sleep(Duration::from_secs(3)).await;

        let api_resource = ApiResource {
            group: "example.com".into(),
            version: "v1".into(),
            api_version: "example.com/v1".into(),
            kind: "Widget".into(),
            plural: "widgets".into(),
        };
        let widget_api: Api<DynamicObject> = Api::namespaced_with(client.clone(), "default", &api_resource);
        let widget: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w1"},
        }))
        .unwrap();
        widget_api.create(&PostParams::default(), &widget).await.unwrap();

        let observed = wait_for_events(&events, 1).await;
        assert_eq!(kinds_for(&observed, "default/w1"), vec![EventKind::Added]);

        widget_api.delete("w1", &DeleteParams::default()).await.ok();
        crd_api.delete("widgets.example.com", &DeleteParams::default()).await.ok();
        engine.stop().await;
    }

    /// S5 — dispatcher isolation: one subscriber erroring must not prevent
    /// another from observing the same event, nor the JSON sink from
    /// being written.
    #[tokio::test]
    async fn s5_dispatcher_isolation() {
        let client = Client::try_default().await.unwrap();
        let dir = std::env::temp_dir().join(format!("faro-e2e-{}", uuid_like()));
        let config = EngineConfig {
            resources: vec![resource_entry("v1/configmaps", Scope::Namespaced, vec!["t3"])],
            output_dir: Some(dir.to_string_lossy().into_owned()),
            json_export: true,
            ..Default::default()
        };
        let engine = Engine::new(client.clone(), config, Arc::new(NoopMetricsSink))
            .with_json_export()
            .await
            .unwrap();

        engine
            .add_subscriber(subscriber(|_event| async move {
                Err("subscriber a always fails".to_string())
            }))
            .await;

        let b_seen: Events = Arc::new(Mutex::new(Vec::new()));
        let b_seen_clone = b_seen.clone();
        engine
            .add_subscriber(subscriber(move |event| {
                let b_seen = b_seen_clone.clone();
                async move {
                    b_seen.lock().await.push(event);
                    Ok(())
                }
            }))
            .await;

        engine.start().await.unwrap();

        let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), "t3");
        let cm: ConfigMap = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "isolation-test"},
        }))
        .unwrap();
        cm_api.create(&PostParams::default(), &cm).await.unwrap();

        let observed = wait_for_events(&b_seen, 1).await;
        assert_eq!(kinds_for(&observed, "t3/isolation-test"), vec![EventKind::Added]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let contents = tokio::fs::read_to_string(dir.join("events.jsonl")).await.unwrap();
        assert!(contents.contains("isolation-test"));

        cm_api.delete("isolation-test", &DeleteParams::default()).await.ok();
        engine.stop().await;
    }

    /// S6 — shutdown cleanliness: `Stop()` returns within the bounded
    /// window after creating and observing two objects.
    #[tokio::test]
    async fn s6_shutdown_cleanliness() {
        let client = Client::try_default().await.unwrap();
        let config = EngineConfig {
            resources: vec![resource_entry("v1/configmaps", Scope::Namespaced, vec!["t3"])],
            ..Default::default()
        };
        let (engine, events) = collecting_engine(client.clone(), config).await;

        let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), "t3");
        for name in ["shutdown-a", "shutdown-b"] {
            let cm: ConfigMap = serde_json::from_value(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name},
            }))
            .unwrap();
            cm_api.create(&PostParams::default(), &cm).await.unwrap();
        }
        wait_for_events(&events, 2).await;

        let stopped = timeout(Duration::from_secs(25), engine.stop()).await;
        assert!(stopped.is_ok(), "Stop() exceeded its bounded shutdown window");

        for name in ["shutdown-a", "shutdown-b"] {
            cm_api.delete(name, &DeleteParams::default()).await.ok();
        }
    }
}

/// Deterministic-enough suffix for scratch output-dir paths across test
/// runs in the same process; not a real UUID, just collision-avoidance.
#[cfg(all(test, feature = "e2e-tests"))]
fn uuid_like() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}
