//! Buildpack detection
//!
//! Resolves a buildpack order into the first group whose buildpacks
//! collectively satisfy their own provide/require graph. Each
//! buildpack's `bin/detect` runs as a subprocess; trials are memoized
//! by `(id, version)` so a buildpack referenced from several groups
//! executes once per order evaluation.

use crate::buildpack::{Buildpack, BuildpackGroup, BuildpackInfo, BuildpackOrder};
use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Detect subprocess exit code for "pass"
pub const CODE_DETECT_PASS: i32 = 0;
/// Detect subprocess exit code for "fail"; anything else is an error
pub const CODE_DETECT_FAIL: i32 = 100;

/// One requirement declared by a buildpack's detect plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Require {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// One dependency declared as provided
#[derive(Debug, Clone, Deserialize)]
pub struct Provide {
    pub name: String,
}

/// The resolved build plan: one entry per requirement name, in first
/// mention order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub providers: Vec<Buildpack>,
    #[serde(default)]
    pub requires: Vec<Require>,
}

impl BuildPlan {
    /// Write `plan.toml`
    pub async fn write_file(&self, path: &Path) -> KilnResult<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| KilnError::io(format!("writing plan file {}", path.display()), e))
    }
}

/// Shape of the plan file a detect subprocess writes
#[derive(Debug, Clone, Default, Deserialize)]
struct TrialPlan {
    #[serde(default)]
    provides: Vec<Provide>,
    #[serde(default)]
    requires: Vec<Require>,
}

/// Outcome of one buildpack's detect subprocess
#[derive(Debug, Clone, Default)]
struct Trial {
    code: i32,
    provides: Vec<Provide>,
    requires: Vec<Require>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

type TrialKey = (String, String);

/// Drives detection for one app
pub struct Detector {
    app_dir: PathBuf,
    platform_dir: PathBuf,
    buildpacks_dir: PathBuf,
    trials: Mutex<HashMap<TrialKey, Trial>>,
}

/// A buildpack queued for trial along with its resolved descriptor
#[derive(Debug, Clone)]
struct Candidate {
    buildpack: Buildpack,
    info: BuildpackInfo,
}

impl Detector {
    pub fn new(
        app_dir: impl Into<PathBuf>,
        platform_dir: impl Into<PathBuf>,
        buildpacks_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_dir: app_dir.into(),
            platform_dir: platform_dir.into(),
            buildpacks_dir: buildpacks_dir.into(),
            trials: Mutex::new(HashMap::new()),
        }
    }

    /// Try each group of the order; the first group whose provide/require
    /// graph resolves wins.
    pub async fn detect(&self, order: &BuildpackOrder) -> KilnResult<(BuildpackGroup, BuildPlan)> {
        let (group, entries) = self
            .detect_order(order.clone(), Vec::new(), Vec::new(), false, Vec::new())
            .await?;
        Ok((
            BuildpackGroup { group },
            BuildPlan { entries },
        ))
    }

    fn detect_order(
        &self,
        order: BuildpackOrder,
        done: Vec<Candidate>,
        next: Vec<Buildpack>,
        optional: bool,
        expansion: Vec<TrialKey>,
    ) -> Pin<Box<dyn Future<Output = KilnResult<(Vec<Buildpack>, Vec<PlanEntry>)>> + Send + '_>>
    {
        Box::pin(async move {
            for group in order.0 {
                let mut combined = group.group.clone();
                combined.extend(next.iter().cloned());
                match self
                    .detect_group(done.clone(), combined, expansion.clone())
                    .await
                {
                    Err(KilnError::DetectionFailed) => continue,
                    other => return other,
                }
            }
            if optional {
                return self.detect_group(done, next, expansion).await;
            }
            Err(KilnError::DetectionFailed)
        })
    }

    fn detect_group(
        &self,
        mut done: Vec<Candidate>,
        todo: Vec<Buildpack>,
        expansion: Vec<TrialKey>,
    ) -> Pin<Box<dyn Future<Output = KilnResult<(Vec<Buildpack>, Vec<PlanEntry>)>> + Send + '_>>
    {
        Box::pin(async move {
            for (i, bp) in todo.iter().enumerate() {
                if done.iter().any(|c| c.buildpack.id == bp.id) {
                    continue;
                }
                let info = bp.lookup(&self.buildpacks_dir).await?;
                if let Some(nested) = info.order {
                    let key = bp.key();
                    if expansion.contains(&key) {
                        return Err(KilnError::CyclicOrder(bp.to_string()));
                    }
                    let mut expansion = expansion.clone();
                    expansion.push(key);
                    let next = todo[i + 1..].to_vec();
                    return self
                        .detect_order(nested, done, next, bp.optional, expansion)
                        .await;
                }
                done.push(Candidate {
                    buildpack: bp.clone(),
                    info,
                });
            }

            self.run_trials(&done).await?;
            self.process(&done)
        })
    }

    /// Run detect subprocesses for every candidate that has not been
    /// tried yet; trials within a group are independent.
    async fn run_trials(&self, candidates: &[Candidate]) -> KilnResult<()> {
        let mut join_set = JoinSet::new();
        let mut queued: Vec<TrialKey> = Vec::new();

        for candidate in candidates {
            let key = candidate.buildpack.key();
            if queued.contains(&key) {
                continue;
            }
            {
                let trials = self.trials.lock().expect("trial map poisoned");
                if trials.contains_key(&key) {
                    continue;
                }
            }
            queued.push(key.clone());

            let buildpack = candidate.buildpack.clone();
            let info = candidate.info.clone();
            let app_dir = self.app_dir.clone();
            let platform_dir = self.platform_dir.clone();
            join_set.spawn(async move {
                let trial = run_detect(&buildpack, &info, &app_dir, &platform_dir).await;
                (buildpack.key(), trial)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (key, trial) =
                joined.map_err(|e| KilnError::Internal(format!("detect trial panicked: {e}")))?;
            self.trials
                .lock()
                .expect("trial map poisoned")
                .entry(key)
                .or_insert(trial);
        }
        Ok(())
    }

    /// Resolve the provide/require graph over the joined trial results
    fn process(&self, candidates: &[Candidate]) -> KilnResult<(Vec<Buildpack>, Vec<PlanEntry>)> {
        let trials = self.trials.lock().expect("trial map poisoned");

        for candidate in candidates {
            let bp = &candidate.buildpack;
            let trial = trials.get(&bp.key()).ok_or_else(|| {
                KilnError::Internal(format!("missing detection of '{bp}'"))
            })?;
            if !trial.stdout.is_empty() {
                info!("======== Output: {bp} ========\n{}", trial.stdout.trim_end());
            }
            if !trial.stderr.is_empty() {
                info!("======== Errors: {bp} ========\n{}", trial.stderr.trim_end());
            }
            if let Some(error) = &trial.error {
                info!("======== Error: {bp} ========\n{error}");
            }
        }

        info!("======== Results ========");

        let mut results: Vec<DetectResult> = Vec::new();
        let mut detected = true;
        for candidate in candidates {
            let bp = &candidate.buildpack;
            let trial = &trials[&bp.key()];
            match trial.code {
                CODE_DETECT_PASS => {
                    info!("pass: {bp}");
                    results.push(DetectResult {
                        buildpack: bp.clone(),
                        provides: trial.provides.clone(),
                        requires: trial.requires.clone(),
                    });
                }
                CODE_DETECT_FAIL => {
                    if bp.optional {
                        info!("skip: {bp}");
                    } else {
                        info!("fail: {bp}");
                    }
                    detected = detected && bp.optional;
                }
                code => {
                    info!("err:  {bp} ({code})");
                    detected = detected && bp.optional;
                }
            }
        }
        if !detected {
            return Err(KilnError::DetectionFailed);
        }

        // Optional buildpacks with unmet requires or unused provides are
        // removed and the graph re-resolved until it is stable.
        let deps = loop {
            let deps = DepMap::new(&results);

            let mut retry = false;
            for (name, bp) in deps.unmet_requires() {
                retry = true;
                if !bp.optional {
                    info!("fail: {bp} requires {name}");
                    return Err(KilnError::DetectionFailed);
                }
                info!("skip: {bp} requires {name}");
                results.retain(|r| r.buildpack != bp);
            }
            for (name, bp) in deps.unmet_provides() {
                retry = true;
                if !bp.optional {
                    info!("fail: {bp} provides unused {name}");
                    return Err(KilnError::DetectionFailed);
                }
                info!("skip: {bp} provides unused {name}");
                results.retain(|r| r.buildpack != bp);
            }
            if !retry {
                break deps;
            }
        };

        if results.is_empty() {
            info!("fail: no buildpacks detected");
            return Err(KilnError::DetectionFailed);
        }

        let group = results.iter().map(|r| r.buildpack.clone()).collect();
        Ok((group, deps.into_entries()))
    }
}

/// Fork `bin/detect` and collect its verdict
async fn run_detect(
    buildpack: &Buildpack,
    info: &BuildpackInfo,
    app_dir: &Path,
    platform_dir: &Path,
) -> Trial {
    let error_trial = |reason: String| Trial {
        code: -1,
        error: Some(reason),
        ..Trial::default()
    };

    let app_dir = match app_dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => return error_trial(format!("resolving app dir: {e}")),
    };
    let platform_dir = match platform_dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => return error_trial(format!("resolving platform dir: {e}")),
    };

    let plan_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => return error_trial(format!("creating plan dir: {e}")),
    };
    let plan_path = plan_dir.path().join("plan.toml");
    if let Err(e) = std::fs::write(&plan_path, "") {
        return error_trial(format!("creating plan file: {e}"));
    }

    debug!("Running detect for {buildpack}");
    let output = Command::new(info.path.join("bin").join("detect"))
        .arg(&platform_dir)
        .arg(&plan_path)
        .current_dir(&app_dir)
        .env("BP_ID", &buildpack.id)
        .env("BP_VERSION", &buildpack.version)
        .env("BP_PATH", &info.path)
        .env("BP_TOML", &info.toml_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => return error_trial(format!("spawning detect: {e}")),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let code = output.status.code().unwrap_or(-1);

    if code != CODE_DETECT_PASS {
        return Trial {
            code,
            stdout,
            stderr,
            ..Trial::default()
        };
    }

    let plan: TrialPlan = match std::fs::read_to_string(&plan_path)
        .map_err(|e| e.to_string())
        .and_then(|content| toml::from_str(&content).map_err(|e| e.to_string()))
    {
        Ok(plan) => plan,
        Err(e) => return error_trial(format!("reading plan output: {e}")),
    };

    Trial {
        code,
        provides: plan.provides,
        requires: plan.requires,
        stdout,
        stderr,
        error: None,
    }
}

#[derive(Debug, Clone)]
struct DetectResult {
    buildpack: Buildpack,
    provides: Vec<Provide>,
    requires: Vec<Require>,
}

#[derive(Debug, Default)]
struct DepEntry {
    providers: Vec<Buildpack>,
    requires: Vec<Require>,
    /// Requirers seen before any provider; unmet unless resolved away
    early_requires: Vec<Buildpack>,
    /// Providers not yet consumed by a requirer
    extra_provides: Vec<Buildpack>,
}

/// Requirement-name keyed dependency map, insertion ordered.
///
/// Accumulation walks the results in group order: a provide is pending
/// until a later (or same) requirer consumes it; a require with no
/// pending or consumed provider is unmet.
#[derive(Debug, Default)]
struct DepMap {
    names: Vec<String>,
    entries: HashMap<String, DepEntry>,
}

impl DepMap {
    fn new(results: &[DetectResult]) -> Self {
        let mut map = Self::default();
        for result in results {
            for provide in &result.provides {
                map.provide(&result.buildpack, &provide.name);
            }
            for require in &result.requires {
                map.require(&result.buildpack, require);
            }
        }
        map
    }

    fn entry(&mut self, name: &str) -> &mut DepEntry {
        if !self.entries.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.entries.entry(name.to_string()).or_default()
    }

    fn provide(&mut self, bp: &Buildpack, name: &str) {
        self.entry(name).extra_provides.push(bp.clone());
    }

    fn require(&mut self, bp: &Buildpack, require: &Require) {
        let entry = self.entry(&require.name);
        entry.providers.append(&mut entry.extra_provides);
        if entry.providers.is_empty() {
            entry.early_requires.push(bp.clone());
        } else {
            entry.requires.push(require.clone());
        }
    }

    fn unmet_requires(&self) -> Vec<(String, Buildpack)> {
        self.collect(|entry| &entry.early_requires)
    }

    fn unmet_provides(&self) -> Vec<(String, Buildpack)> {
        self.collect(|entry| &entry.extra_provides)
    }

    fn collect<'a, F>(&'a self, select: F) -> Vec<(String, Buildpack)>
    where
        F: Fn(&'a DepEntry) -> &'a Vec<Buildpack>,
    {
        let mut unmet = Vec::new();
        for name in &self.names {
            for bp in select(&self.entries[name]) {
                unmet.push((name.clone(), bp.clone()));
            }
        }
        unmet
    }

    fn into_entries(mut self) -> Vec<PlanEntry> {
        self.names
            .iter()
            .filter_map(|name| {
                let entry = self.entries.remove(name)?;
                Some(PlanEntry {
                    providers: entry.providers,
                    requires: entry.requires,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        app_dir: PathBuf,
        platform_dir: PathBuf,
        buildpacks_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let app_dir = temp.path().join("app");
            let platform_dir = temp.path().join("platform");
            let buildpacks_dir = temp.path().join("buildpacks");
            for dir in [&app_dir, &platform_dir, &buildpacks_dir] {
                std::fs::create_dir_all(dir).unwrap();
            }
            Self {
                _temp: temp,
                app_dir,
                platform_dir,
                buildpacks_dir,
            }
        }

        fn detector(&self) -> Detector {
            Detector::new(&self.app_dir, &self.platform_dir, &self.buildpacks_dir)
        }

        fn write_buildpack(&self, id: &str, version: &str, detect_script: &str) {
            let root = self
                .buildpacks_dir
                .join(id.replace('/', "_"))
                .join(version);
            std::fs::create_dir_all(root.join("bin")).unwrap();
            std::fs::write(
                root.join("buildpack.toml"),
                format!("[buildpack]\nid = \"{id}\"\nversion = \"{version}\"\n"),
            )
            .unwrap();
            let script_path = root.join("bin/detect");
            std::fs::write(&script_path, detect_script).unwrap();
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .unwrap();
        }

        fn write_meta_buildpack(&self, id: &str, version: &str, order: &str) {
            let root = self
                .buildpacks_dir
                .join(id.replace('/', "_"))
                .join(version);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(
                root.join("buildpack.toml"),
                format!("[buildpack]\nid = \"{id}\"\nversion = \"{version}\"\n\n{order}"),
            )
            .unwrap();
        }
    }

    fn bp(id: &str, version: &str) -> Buildpack {
        Buildpack::new(id, version)
    }

    fn optional(id: &str, version: &str) -> Buildpack {
        Buildpack {
            optional: true,
            ..Buildpack::new(id, version)
        }
    }

    fn order(groups: Vec<Vec<Buildpack>>) -> BuildpackOrder {
        BuildpackOrder(
            groups
                .into_iter()
                .map(|group| BuildpackGroup { group })
                .collect(),
        )
    }

    const PASS_PROVIDING_X: &str = r#"#!/bin/sh
cat > "$2" <<EOF
[[provides]]
name = "x"
EOF
exit 0
"#;

    const PASS_REQUIRING_X: &str = r#"#!/bin/sh
cat > "$2" <<EOF
[[requires]]
name = "x"
version = "1.0"
EOF
exit 0
"#;

    const PASS_EMPTY_PLAN: &str = "#!/bin/sh\nexit 0\n";
    const FAIL: &str = "#!/bin/sh\nexit 100\n";
    const CRASH: &str = "#!/bin/sh\nexit 7\n";

    #[tokio::test]
    async fn single_group_passes() {
        let fx = Fixture::new();
        fx.write_buildpack("one", "1", PASS_EMPTY_PLAN);

        let (group, plan) = fx
            .detector()
            .detect(&order(vec![vec![bp("one", "1")]]))
            .await
            .unwrap();
        assert_eq!(group.group, vec![bp("one", "1")]);
        assert!(plan.entries.is_empty());
    }

    #[tokio::test]
    async fn optional_failure_is_skipped_and_plan_resolves() {
        let fx = Fixture::new();
        fx.write_buildpack("a", "1", FAIL);
        fx.write_buildpack("b", "1", PASS_PROVIDING_X);
        fx.write_buildpack("c", "1", PASS_REQUIRING_X);

        let (group, plan) = fx
            .detector()
            .detect(&order(vec![vec![
                optional("a", "1"),
                bp("b", "1"),
                bp("c", "1"),
            ]]))
            .await
            .unwrap();

        assert_eq!(group.group, vec![bp("b", "1"), bp("c", "1")]);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].providers, vec![bp("b", "1")]);
        assert_eq!(plan.entries[0].requires[0].name, "x");
        assert_eq!(plan.entries[0].requires[0].version.as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn required_failure_falls_through_to_next_group() {
        let fx = Fixture::new();
        fx.write_buildpack("a", "1", FAIL);
        fx.write_buildpack("b", "1", PASS_EMPTY_PLAN);

        let (group, _) = fx
            .detector()
            .detect(&order(vec![vec![bp("a", "1")], vec![bp("b", "1")]]))
            .await
            .unwrap();
        assert_eq!(group.group, vec![bp("b", "1")]);
    }

    #[tokio::test]
    async fn all_groups_failing_is_detection_failure() {
        let fx = Fixture::new();
        fx.write_buildpack("a", "1", FAIL);

        let err = fx
            .detector()
            .detect(&order(vec![vec![bp("a", "1")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DetectionFailed));
    }

    #[tokio::test]
    async fn crash_fails_a_required_buildpack() {
        let fx = Fixture::new();
        fx.write_buildpack("a", "1", CRASH);

        let err = fx
            .detector()
            .detect(&order(vec![vec![bp("a", "1")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DetectionFailed));
    }

    #[tokio::test]
    async fn unmet_require_fails_the_group() {
        let fx = Fixture::new();
        fx.write_buildpack("c", "1", PASS_REQUIRING_X);

        let err = fx
            .detector()
            .detect(&order(vec![vec![bp("c", "1")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DetectionFailed));
    }

    #[tokio::test]
    async fn optional_with_unused_provide_is_removed() {
        let fx = Fixture::new();
        fx.write_buildpack("a", "1", PASS_PROVIDING_X);
        fx.write_buildpack("b", "1", PASS_EMPTY_PLAN);

        let (group, plan) = fx
            .detector()
            .detect(&order(vec![vec![optional("a", "1"), bp("b", "1")]]))
            .await
            .unwrap();
        assert_eq!(group.group, vec![bp("b", "1")]);
        assert!(plan.entries.is_empty());
    }

    #[tokio::test]
    async fn provider_after_requirer_is_unmet() {
        let fx = Fixture::new();
        fx.write_buildpack("c", "1", PASS_REQUIRING_X);
        fx.write_buildpack("b", "1", PASS_PROVIDING_X);

        // c requires x before b provides it; provides do not satisfy
        // earlier requires
        let err = fx
            .detector()
            .detect(&order(vec![vec![bp("c", "1"), bp("b", "1")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DetectionFailed));
    }

    #[tokio::test]
    async fn trials_are_memoized_across_groups() {
        let fx = Fixture::new();
        let counter = fx.app_dir.join("count");
        fx.write_buildpack(
            "counted",
            "1",
            "#!/bin/sh\necho run >> count\nexit 100\n",
        );
        fx.write_buildpack("b", "1", PASS_EMPTY_PLAN);

        let (group, _) = fx
            .detector()
            .detect(&order(vec![
                vec![bp("counted", "1")],
                vec![bp("counted", "1"), bp("b", "1")],
                vec![bp("b", "1")],
            ]))
            .await
            .unwrap();

        assert_eq!(group.group, vec![bp("b", "1")]);
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_group_collapse() {
        let fx = Fixture::new();
        let counter = fx.app_dir.join("count");
        fx.write_buildpack("counted", "1", "#!/bin/sh\necho run >> count\nexit 0\n");

        let (group, _) = fx
            .detector()
            .detect(&order(vec![vec![bp("counted", "1"), bp("counted", "1")]]))
            .await
            .unwrap();

        assert_eq!(group.group.len(), 1);
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn detect_env_vars_are_set() {
        let fx = Fixture::new();
        fx.write_buildpack(
            "env-check",
            "2.0",
            r#"#!/bin/sh
[ "$BP_ID" = "env-check" ] || exit 9
[ "$BP_VERSION" = "2.0" ] || exit 9
[ -n "$BP_PATH" ] || exit 9
[ -f "$BP_TOML" ] || exit 9
[ -d "$1" ] || exit 9
exit 0
"#,
        );

        let result = fx
            .detector()
            .detect(&order(vec![vec![bp("env-check", "2.0")]]))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn meta_buildpack_order_is_spliced() {
        let fx = Fixture::new();
        fx.write_buildpack("b", "1", PASS_PROVIDING_X);
        fx.write_buildpack("c", "1", PASS_REQUIRING_X);
        fx.write_meta_buildpack(
            "meta",
            "1",
            r#"[[order]]
group = [{ id = "b", version = "1" }]
"#,
        );

        // meta expands to b, and the buildpack queued after meta stays
        let (group, plan) = fx
            .detector()
            .detect(&order(vec![vec![bp("meta", "1"), bp("c", "1")]]))
            .await
            .unwrap();
        assert_eq!(group.group, vec![bp("b", "1"), bp("c", "1")]);
        assert_eq!(plan.entries.len(), 1);
    }

    #[tokio::test]
    async fn optional_meta_buildpack_can_drop_out() {
        let fx = Fixture::new();
        fx.write_buildpack("fails", "1", FAIL);
        fx.write_buildpack("b", "1", PASS_EMPTY_PLAN);
        fx.write_meta_buildpack(
            "meta",
            "1",
            r#"[[order]]
group = [{ id = "fails", version = "1" }]
"#,
        );

        let (group, _) = fx
            .detector()
            .detect(&order(vec![vec![optional("meta", "1"), bp("b", "1")]]))
            .await
            .unwrap();
        assert_eq!(group.group, vec![bp("b", "1")]);
    }

    #[tokio::test]
    async fn cyclic_meta_buildpack_is_rejected() {
        let fx = Fixture::new();
        fx.write_meta_buildpack(
            "loop",
            "1",
            r#"[[order]]
group = [{ id = "loop", version = "1" }]
"#,
        );

        let err = fx
            .detector()
            .detect(&order(vec![vec![bp("loop", "1")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CyclicOrder(_)));
        assert!(err.to_string().contains("loop@1"));
    }

    #[tokio::test]
    async fn plan_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let plan = BuildPlan {
            entries: vec![PlanEntry {
                providers: vec![bp("b", "1")],
                requires: vec![Require {
                    name: "x".to_string(),
                    version: Some("1.0".to_string()),
                    metadata: serde_json::json!({"launch": true}),
                }],
            }],
        };
        let path = temp.path().join("plan.toml");
        plan.write_file(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: BuildPlan = toml::from_str(&content).unwrap();
        assert_eq!(parsed.entries[0].requires[0].name, "x");
        assert_eq!(parsed.entries[0].providers[0].id, "b");
    }
}
