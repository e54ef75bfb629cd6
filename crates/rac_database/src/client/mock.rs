//! In-memory [`ClusterClient`] for unit tests.
//!
//! Objects are stored as JSON keyed by (kind, namespace, name). Every call that
//! reaches the store is recorded so tests can assert on what the engine did,
//! not just on the end state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use serde_json::{json, Value};

use super::{ClusterClient, ExecOutput, NamespacedObject};
use crate::api::v1::racdatabase::{RacDatabase, RacDatabaseStatus};
use crate::util::errors::{Error, Result, StdError};

type Key = (String, String, String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Default)]
pub struct MockClusterClient {
    objects: Arc<Mutex<BTreeMap<Key, Value>>>,
    pvs: Arc<Mutex<BTreeMap<String, PersistentVolume>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    logs: Arc<Mutex<HashMap<String, String>>>,
    exec_script: Arc<Mutex<Vec<(String, ExecOutput)>>>,
    status_conflicts: Arc<Mutex<u32>>,
    daemonset_ready: Arc<Mutex<Option<i32>>>,
    /// (kind, name) pairs that survive delete, like objects held by a foreign finalizer
    lingering: Arc<Mutex<Vec<(String, String)>>>,
    next_rv: Arc<Mutex<u64>>,
}

pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::StdError(StdError::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })))
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            if let Value::Object(t) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => obj["metadata"]["labels"][k].as_str() == Some(v),
            None => false,
        })
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<K: NamespacedObject>(namespace: &str, name: &str) -> Key {
        (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
    }

    fn record(&self, verb: &'static str, kind: &str, name: &str) {
        self.calls.lock().unwrap().push(Call {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }

    fn bump_rv(&self, obj: &mut Value) {
        let mut rv = self.next_rv.lock().unwrap();
        *rv += 1;
        obj["metadata"]["resourceVersion"] = json!(rv.to_string());
    }

    fn decorate(&self, kind: &str, obj: &mut Value) {
        if kind == "DaemonSet" {
            if let Some(n) = *self.daemonset_ready.lock().unwrap() {
                obj["status"] = json!({
                    "currentNumberScheduled": n,
                    "desiredNumberScheduled": n,
                    "numberMisscheduled": 0,
                    "numberReady": n,
                });
            }
        }
    }

    /// Seeds an object without recording a call.
    pub fn insert<K: NamespacedObject>(&self, namespace: &str, obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(&obj).unwrap();
        value["metadata"]["namespace"] = json!(namespace);
        if value["metadata"]["resourceVersion"].is_null() {
            self.bump_rv(&mut value);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key::<K>(namespace, &name), value);
    }

    pub fn insert_pv(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.pvs.lock().unwrap().insert(name, pv);
    }

    /// Reads an object without recording a call.
    pub fn stored<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn stored_pv(&self, name: &str) -> Option<PersistentVolume> {
        self.pvs.lock().unwrap().get(name).cloned()
    }

    pub fn pv_names(&self) -> Vec<String> {
        self.pvs.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.commands.lock().unwrap().clear();
    }

    /// Commands passed to `exec`, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn set_log(&self, pod: &str, log: &str) {
        self.logs.lock().unwrap().insert(pod.to_string(), log.to_string());
    }

    /// Any exec whose joined command contains `needle` returns `output`. First match wins.
    pub fn script_exec(&self, needle: &str, output: ExecOutput) {
        self.exec_script.lock().unwrap().push((needle.to_string(), output));
    }

    /// The next `n` status writes fail with 409.
    pub fn fail_status_writes(&self, n: u32) {
        *self.status_conflicts.lock().unwrap() = n;
    }

    /// Deletes of `kind`/`name` are accepted but the object stays in the store.
    pub fn linger_on_delete(&self, kind: &str, name: &str) {
        self.lingering.lock().unwrap().push((kind.to_string(), name.to_string()));
    }

    fn lingers(&self, kind: &str, name: &str) -> bool {
        self.lingering
            .lock()
            .unwrap()
            .iter()
            .any(|(k, n)| k == kind && n == name)
    }

    /// DaemonSets report `n` of `n` pods ready as soon as they are written.
    pub fn auto_ready_daemonsets(&self, n: i32) {
        *self.daemonset_ready.lock().unwrap() = Some(n);
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_opt<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let kind = K::kind(&()).to_string();
        self.record("get", &kind, name);
        Ok(self.stored(namespace, name))
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record("create", &kind, &name);
        let key = Self::key::<K>(namespace, &name);
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{kind} {name} already exists")));
        }
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = json!(namespace);
        self.bump_rv(&mut value);
        self.decorate(&kind, &mut value);
        self.objects.lock().unwrap().insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: NamespacedObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        self.record("replace", &kind, name);
        let key = Self::key::<K>(namespace, name);
        let current_rv = match self.objects.lock().unwrap().get(&key) {
            Some(v) => v["metadata"]["resourceVersion"].as_str().map(str::to_string),
            None => return Err(api_error(404, "NotFound", format!("{kind} {name} not found"))),
        };
        if let Some(rv) = &obj.meta().resource_version {
            if Some(rv) != current_rv.as_ref() {
                return Err(api_error(409, "Conflict", "the object has been modified"));
            }
        }
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = json!(namespace);
        self.bump_rv(&mut value);
        self.decorate(&kind, &mut value);
        self.objects.lock().unwrap().insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        let kind = K::kind(&()).to_string();
        self.record("delete", &kind, name);
        let key = Self::key::<K>(namespace, name);
        if self.lingers(&kind, name) {
            return Ok(self.objects.lock().unwrap().contains_key(&key));
        }
        Ok(self.objects.lock().unwrap().remove(&key).is_some())
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        self.record("list", &kind, label_selector);
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, label_selector))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn patch_merge<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<K> {
        let kind = K::kind(&()).to_string();
        self.record("patch", &kind, name);
        let key = Self::key::<K>(namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let Some(value) = objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{kind} {name} not found")));
        };
        merge_patch(value, &patch);
        let mut rv = self.next_rv.lock().unwrap();
        *rv += 1;
        value["metadata"]["resourceVersion"] = json!(rv.to_string());
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RacDatabaseStatus,
    ) -> Result<RacDatabase> {
        self.record("write_status", "RacDatabase", name);
        {
            let mut conflicts = self.status_conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(api_error(409, "Conflict", "the object has been modified"));
            }
        }
        let key = Self::key::<RacDatabase>(namespace, name);
        let mut value = match self.objects.lock().unwrap().get(&key) {
            Some(v) => v.clone(),
            None => return Err(api_error(404, "NotFound", format!("RacDatabase {name} not found"))),
        };
        if let Some(rv) = resource_version {
            if value["metadata"]["resourceVersion"].as_str() != Some(rv.as_str()) {
                return Err(api_error(409, "Conflict", "the object has been modified"));
            }
        }
        value["status"] = serde_json::to_value(status)?;
        self.bump_rv(&mut value);
        self.objects.lock().unwrap().insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.record("get", "PersistentVolume", name);
        Ok(self.stored_pv(name))
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.record("create", "PersistentVolume", &name);
        let mut pvs = self.pvs.lock().unwrap();
        if pvs.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists", format!("PersistentVolume {name} already exists")));
        }
        pvs.insert(name, pv.clone());
        Ok(pv.clone())
    }

    async fn delete_pv(&self, name: &str) -> Result<bool> {
        self.record("delete", "PersistentVolume", name);
        if self.lingers("PersistentVolume", name) {
            return Ok(self.pvs.lock().unwrap().contains_key(name));
        }
        Ok(self.pvs.lock().unwrap().remove(name).is_some())
    }

    async fn pod_logs(&self, _namespace: &str, pod: &str, _container: Option<&str>) -> Result<String> {
        self.record("logs", "Pod", pod);
        self.logs
            .lock()
            .unwrap()
            .get(pod)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("no logs for pod {pod}")))
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        self.record("exec", "Pod", pod);
        let joined = command.join(" ");
        self.commands.lock().unwrap().push(command);
        let script = self.exec_script.lock().unwrap();
        Ok(script
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(ExecOutput {
                success: true,
                ..Default::default()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, app: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([("app".to_string(), app.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let mock = MockClusterClient::new();
        let created = mock.create("ns", &cm("a", "x")).await.unwrap();
        let mut stale = created.clone();
        mock.replace("ns", "a", &created).await.unwrap();

        stale.data = Some([("k".to_string(), "v".to_string())].into());
        let err = mock.replace("ns", "a", &stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let mock = MockClusterClient::new();
        mock.insert("ns", cm("a", "x"));
        mock.insert("ns", cm("b", "y"));
        mock.insert("other", cm("c", "x"));
        let found: Vec<ConfigMap> = mock.list("ns", "app=x").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
        assert_eq!(mock.count("list", "ConfigMap"), 1);
    }

    #[test]
    fn merge_patch_removes_nulls() {
        let mut target = json!({"a": {"b": 1, "c": 2}});
        merge_patch(&mut target, &json!({"a": {"b": null, "d": 3}}));
        assert_eq!(target, json!({"a": {"c": 2, "d": 3}}));
    }
}
