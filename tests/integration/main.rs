//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Cloud Native Buildpacks lifecycle"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn detect_missing_order_fails() {
        kiln()
            .args(["detect", "--order", "/nonexistent/order.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("reading buildpack order"));
    }

    #[test]
    fn restore_requires_a_cache() {
        kiln()
            .args(["restore", "--group", "/nonexistent/group.toml"])
            .assert()
            .failure()
            .code(3)
            .stderr(predicate::str::contains("--cache-dir or --cache-image"));
    }

    #[test]
    fn export_requires_an_image_name() {
        kiln().arg("export").assert().failure();
    }

    #[test]
    fn export_rejects_multiple_registries() {
        kiln()
            .args([
                "export",
                "registry-one.example.com/app",
                "registry-two.example.com/app",
            ])
            .assert()
            .failure()
            .code(3)
            .stderr(predicate::str::contains("multiple registries"));
    }
}

mod lifecycle {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use kiln::image::oci::OciStore;
    use kiln::image::Image;
    use kiln::metadata::{LayersMetadata, LAYERS_METADATA_LABEL};
    use predicates::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    struct Workspace {
        _temp: TempDir,
        root: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();

            for dir in [
                "app", "platform", "layers", "cache", "images", "buildpacks",
            ] {
                std::fs::create_dir_all(root.join(dir)).unwrap();
            }
            std::fs::write(root.join("app/index.js"), "console.log('hello')").unwrap();
            std::fs::write(root.join("launcher"), "#!/bin/sh\nexec \"$@\"\n").unwrap();
            std::fs::write(
                root.join("stack.toml"),
                "[run-image]\nimage = \"stack/run\"\n",
            )
            .unwrap();

            Self { _temp: temp, root }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.root.join(rel)
        }

        fn arg(&self, rel: &str) -> String {
            self.path(rel).to_string_lossy().into_owned()
        }

        fn write_buildpack(&self, id: &str, version: &str, detect_script: &str) {
            let bp_root = self
                .path("buildpacks")
                .join(id.replace('/', "_"))
                .join(version);
            std::fs::create_dir_all(bp_root.join("bin")).unwrap();
            std::fs::write(
                bp_root.join("buildpack.toml"),
                format!("[buildpack]\nid = \"{id}\"\nversion = \"{version}\"\n"),
            )
            .unwrap();
            let detect = bp_root.join("bin/detect");
            std::fs::write(&detect, detect_script).unwrap();
            std::fs::set_permissions(&detect, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn write_layer(&self, bp_escaped: &str, name: &str, meta: &str, content: Option<&str>) {
            let bp_dir = self.path("layers").join(bp_escaped);
            std::fs::create_dir_all(&bp_dir).unwrap();
            std::fs::write(bp_dir.join(format!("{name}.toml")), meta).unwrap();
            if let Some(content) = content {
                std::fs::create_dir_all(bp_dir.join(name)).unwrap();
                std::fs::write(bp_dir.join(name).join("dep.txt"), content).unwrap();
            }
        }

        /// Seed a minimal run image into the layout store
        fn seed_run_image(&self) {
            let store = OciStore::new(self.path("images"));
            let base_tar = self.path("base.tar");
            let file = std::fs::File::create(&base_tar).unwrap();
            let mut builder = tar::Builder::new(file);
            let data = b"run image rootfs";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "etc/os-release", &data[..]).unwrap();
            builder.finish().unwrap();

            tokio_block_on(async {
                let mut run = store.new_scratch_image("stack/run", None).await.unwrap();
                run.set_label("io.buildpacks.stack.id", "io.test.stack")
                    .await
                    .unwrap();
                run.add_layer(&base_tar).await.unwrap();
                let result = run.save(&[]).await.unwrap();
                assert!(result.failures().is_empty());
            });
        }
    }

    fn tokio_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn open_app_image(images: &Path) -> LayersMetadata {
        tokio_block_on(async {
            let store = OciStore::new(images);
            let image = store.open("my/app").await.unwrap();
            assert!(image.found().await.unwrap());
            let label = image.label(LAYERS_METADATA_LABEL).await.unwrap().unwrap();
            serde_json::from_str(&label).unwrap()
        })
    }

    #[test]
    fn full_build_and_rebuild() {
        let ws = Workspace::new();
        ws.seed_run_image();
        ws.write_buildpack(
            "sample/node",
            "0.0.1",
            r#"#!/bin/sh
cat > "$2" <<EOF
[[provides]]
name = "node"
[[requires]]
name = "node"
EOF
exit 0
"#,
        );
        std::fs::write(
            ws.path("order.toml"),
            "[[order]]\ngroup = [{ id = \"sample/node\", version = \"0.0.1\" }]\n",
        )
        .unwrap();

        // detect selects the group and writes the plan
        kiln()
            .args([
                "detect",
                "--app",
                &ws.arg("app"),
                "--platform",
                &ws.arg("platform"),
                "--buildpacks",
                &ws.arg("buildpacks"),
                "--order",
                &ws.arg("order.toml"),
                "--group",
                &ws.arg("group.toml"),
                "--plan",
                &ws.arg("plan.toml"),
            ])
            .assert()
            .success();

        let group = std::fs::read_to_string(ws.path("group.toml")).unwrap();
        assert!(group.contains("sample/node"));
        let plan = std::fs::read_to_string(ws.path("plan.toml")).unwrap();
        assert!(plan.contains("node"));

        // analyze against an absent previous image
        kiln()
            .args([
                "analyze",
                "--layers",
                &ws.arg("layers"),
                "--group",
                &ws.arg("group.toml"),
                "--analyzed",
                &ws.arg("analyzed.toml"),
                "--images",
                &ws.arg("images"),
                "--cache-dir",
                &ws.arg("cache"),
                "my/app",
            ])
            .assert()
            .success();
        assert!(ws.path("analyzed.toml").exists());

        // simulate the build phase: one launch layer, one cache layer
        ws.write_layer("sample_node", "node-home", "launch = true\n", Some("node binaries"));
        ws.write_layer(
            "sample_node",
            "node-cache",
            "cache = true\n",
            Some("cached modules"),
        );
        std::fs::create_dir_all(ws.path("layers/config")).unwrap();
        std::fs::write(
            ws.path("layers/config/metadata.toml"),
            "[[bom]]\nname = \"node\"\nversion = \"20.1.0\"\n",
        )
        .unwrap();

        // export publishes the app image into the store
        kiln()
            .args([
                "export",
                "--layers",
                &ws.arg("layers"),
                "--app",
                &ws.arg("app"),
                "--group",
                &ws.arg("group.toml"),
                "--analyzed",
                &ws.arg("analyzed.toml"),
                "--stack",
                &ws.arg("stack.toml"),
                "--launcher",
                &ws.arg("launcher"),
                "--images",
                &ws.arg("images"),
                "my/app",
            ])
            .assert()
            .success();

        let label = open_app_image(&ws.path("images"));
        assert!(label.app.sha.starts_with("sha256:"));
        assert_eq!(label.buildpacks.len(), 1);
        assert!(label.buildpacks[0].layers.contains_key("node-home"));
        assert!(!label.buildpacks[0].layers.contains_key("node-cache"));

        // cache publishes the cache layer
        kiln()
            .args([
                "cache",
                "--layers",
                &ws.arg("layers"),
                "--group",
                &ws.arg("group.toml"),
                "--cache-dir",
                &ws.arg("cache"),
            ])
            .assert()
            .success();
        assert!(ws.path("cache/committed").exists());

        // wipe the cache layer's contents, then restore brings them back
        std::fs::remove_dir_all(ws.path("layers/sample_node/node-cache")).unwrap();
        kiln()
            .args([
                "restore",
                "--layers",
                &ws.arg("layers"),
                "--group",
                &ws.arg("group.toml"),
                "--cache-dir",
                &ws.arg("cache"),
            ])
            .assert()
            .success();
        assert_eq!(
            std::fs::read_to_string(ws.path("layers/sample_node/node-cache/dep.txt")).unwrap(),
            "cached modules"
        );

        // second export reuses every unchanged layer
        kiln()
            .args([
                "export",
                "--layers",
                &ws.arg("layers"),
                "--app",
                &ws.arg("app"),
                "--group",
                &ws.arg("group.toml"),
                "--analyzed",
                &ws.arg("analyzed.toml"),
                "--stack",
                &ws.arg("stack.toml"),
                "--launcher",
                &ws.arg("launcher"),
                "--images",
                &ws.arg("images"),
                "-vv",
                "my/app",
            ])
            .assert()
            .success();

        let second = open_app_image(&ws.path("images"));
        assert_eq!(second.app.sha, label.app.sha);
        assert_eq!(second.launcher.sha, label.launcher.sha);
    }

    #[test]
    fn detection_failure_exit_code() {
        let ws = Workspace::new();
        ws.write_buildpack("sample/never", "0.0.1", "#!/bin/sh\nexit 100\n");
        std::fs::write(
            ws.path("order.toml"),
            "[[order]]\ngroup = [{ id = \"sample/never\", version = \"0.0.1\" }]\n",
        )
        .unwrap();

        kiln()
            .args([
                "detect",
                "--app",
                &ws.arg("app"),
                "--platform",
                &ws.arg("platform"),
                "--buildpacks",
                &ws.arg("buildpacks"),
                "--order",
                &ws.arg("order.toml"),
                "--group",
                &ws.arg("group.toml"),
                "--plan",
                &ws.arg("plan.toml"),
            ])
            .assert()
            .failure()
            .code(6)
            .stderr(predicate::str::contains("No buildpack group"));
    }
}
