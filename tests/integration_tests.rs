//! Integration tests for the alternate binary
//!
//! These drive the CLI end to end with shell-script stage runners.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create an alternate Command
fn alternate() -> Command {
    cargo_bin_cmd!("alternate")
}

/// Helper to create a temporary work directory
fn create_temp_workdir() -> TempDir {
    TempDir::new().unwrap()
}

fn create_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// Trainer that writes a checkpoint with a shared backbone layer and a
/// stage-specific head layer.
const TRAIN_SCRIPT: &str = r#"#!/bin/sh
cat > /dev/null
mkdir -p "$(dirname "$ALTERNATE_OUTPUT")"
printf '{"arg_params":{"conv1_weight":{"shape":[2],"data":[1.0,2.0]},"%s_head":{"shape":[1],"data":[3.0]}}}' "$ALTERNATE_STAGE" > "$ALTERNATE_OUTPUT"
echo "$ALTERNATE_STAGE" >> stages.log
"#;

const INFER_SCRIPT: &str = r#"#!/bin/sh
cat > /dev/null
mkdir -p "$(dirname "$ALTERNATE_OUTPUT")"
echo '[]' > "$ALTERNATE_OUTPUT"
echo "$ALTERNATE_STAGE $ALTERNATE_DEVICE" >> stages.log
"#;

/// Write scripts and an alternate.toml pointing at them.
fn setup_runners(dir: &TempDir) {
    setup_runners_in(dir.path());
}

fn setup_runners_in(dir: &Path) {
    let train = create_script(dir, "train.sh", TRAIN_SCRIPT);
    let infer = create_script(dir, "infer.sh", INFER_SCRIPT);
    fs::write(
        dir.join("alternate.toml"),
        format!(
            "[runner]\ntrain_rpn = \"{}\"\ntrain_rcnn = \"{}\"\ninfer_rpn = \"{}\"\n",
            train.display(),
            train.display(),
            infer.display()
        ),
    )
    .unwrap();
}

fn train_args(dir: &TempDir) -> Vec<String> {
    vec![
        "--work-dir".to_string(),
        dir.path().display().to_string(),
        "train".to_string(),
        "--image-set".to_string(),
        "2007_trainval+2012_trainval".to_string(),
        "--rpn-epoch".to_string(),
        "2".to_string(),
        "--rcnn-epoch".to_string(),
        "1".to_string(),
    ]
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_alternate_help() {
        alternate()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("train"))
            .stdout(predicate::str::contains("submission"));
    }

    #[test]
    fn test_alternate_version() {
        alternate().arg("--version").assert().success();
    }

    #[test]
    fn test_train_help_lists_schedule_flags() {
        alternate()
            .args(["train", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--rpn-lr-step"))
            .stdout(predicate::str::contains("--gpus"));
    }
}

// =============================================================================
// Train Tests
// =============================================================================

mod train {
    use super::*;

    #[test]
    fn test_dry_run_prints_eight_stages() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["train", "--dry-run", "--rpn-epoch", "3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1. train_rpn1"))
            .stdout(predicate::str::contains("model/rpn1-0003"))
            .stdout(predicate::str::contains("8. combine_final"));

        assert!(!dir.path().join(".alternate").exists());
    }

    #[test]
    fn test_underscore_flag_aliases() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["train", "--dry-run", "--image_set", "a+b", "--rcnn_epoch", "4"])
            .assert()
            .success()
            .stdout(predicate::str::contains("over [a, b]"))
            .stdout(predicate::str::contains("model/rcnn1-0004"));
    }

    #[test]
    fn test_unknown_network_fails_before_any_stage() {
        let dir = create_temp_workdir();
        setup_runners(&dir);

        alternate()
            .current_dir(dir.path())
            .args(["train", "--network", "lenet"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown network 'lenet'"));

        assert!(!dir.path().join("stages.log").exists());
    }

    #[test]
    fn test_malformed_lr_step_fails() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["train", "--dry-run", "--rpn-lr-step", "six"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid learning-rate step"));
    }

    #[test]
    fn test_full_pipeline_writes_final_model() {
        let dir = create_temp_workdir();
        setup_runners(&dir);

        alternate()
            .args(train_args(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Final model:"))
            .stdout(predicate::str::contains("final-0000.params.json"));

        let model = dir.path().join("model");
        for name in [
            "rpn1-0002",
            "rcnn1-0001",
            "rpn2-0002",
            "rcnn2-0000",
            "rcnn2-0001",
            "final-0000",
        ] {
            assert!(
                model.join(format!("{}.params.json", name)).exists(),
                "missing checkpoint {}",
                name
            );
        }

        let log = fs::read_to_string(dir.path().join("stages.log")).unwrap();
        let stages: Vec<&str> = log.lines().collect();
        assert_eq!(
            stages,
            vec![
                "train_rpn1",
                "infer_rpn1 0",
                "infer_rpn1 0",
                "train_rcnn1",
                "train_rpn2",
                "infer_rpn2 0",
                "infer_rpn2 0",
                "train_rcnn2",
            ]
        );

        // final model keeps rpn2's layers and picks up rcnn2's head
        let final_model =
            fs::read_to_string(model.join("final-0000.params.json")).unwrap();
        assert!(final_model.contains("train_rpn2_head"));
        assert!(final_model.contains("train_rcnn2_head"));
    }

    #[test]
    fn test_runner_commands_from_environment() {
        let dir = create_temp_workdir();
        let train = create_script(dir.path(), "train.sh", TRAIN_SCRIPT);
        let infer = create_script(dir.path(), "infer.sh", INFER_SCRIPT);

        alternate()
            .env("ALTERNATE_TRAIN_RPN_CMD", train.display().to_string())
            .env("ALTERNATE_TRAIN_RCNN_CMD", train.display().to_string())
            .env("ALTERNATE_INFER_RPN_CMD", infer.display().to_string())
            .args(train_args(&dir))
            .assert()
            .success();

        assert!(dir.path().join("model/final-0000.params.json").exists());
    }

    #[test]
    fn test_failed_stage_aborts_and_is_recorded() {
        let dir = create_temp_workdir();
        setup_runners(&dir);
        create_script(
            dir.path(),
            "infer.sh",
            "#!/bin/sh\ncat > /dev/null\necho 'device lost' >&2\nexit 4\n",
        );

        alternate()
            .args(train_args(&dir))
            .assert()
            .failure()
            .stderr(predicate::str::contains("infer_rpn1"))
            .stderr(predicate::str::contains("device lost"));

        assert!(dir.path().join("model/rpn1-0002.params.json").exists());
        assert!(!dir.path().join("model/rcnn1-0001.params.json").exists());

        alternate()
            .args(["--work-dir", &dir.path().display().to_string(), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("train_rpn1"))
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_continue_pipeline_skips_completed_stages() {
        let dir = create_temp_workdir();
        setup_runners(&dir);

        alternate().args(train_args(&dir)).assert().success();
        fs::remove_file(dir.path().join("stages.log")).unwrap();

        let mut args = train_args(&dir);
        args.push("--continue-pipeline".to_string());
        alternate()
            .args(args)
            .assert()
            .success()
            .stdout(predicate::str::contains("Reused from previous run:"));

        assert!(!dir.path().join("stages.log").exists());
    }

    #[test]
    fn test_continue_pipeline_reruns_after_config_change() {
        let dir = create_temp_workdir();
        setup_runners(&dir);

        alternate().args(train_args(&dir)).assert().success();
        fs::remove_file(dir.path().join("stages.log")).unwrap();

        let mut args = train_args(&dir);
        args.extend(["--rpn-lr".to_string(), "0.002".to_string()]);
        args.push("--continue-pipeline".to_string());
        alternate()
            .args(args)
            .assert()
            .success()
            .stdout(predicate::str::contains("Reused from previous run:").not());

        let log = fs::read_to_string(dir.path().join("stages.log")).unwrap();
        assert_eq!(log.lines().count(), 8);
    }

    #[test]
    fn test_relative_work_dir() {
        let dir = create_temp_workdir();
        let work_dir = dir.path().join("wd");
        fs::create_dir(&work_dir).unwrap();
        setup_runners_in(&work_dir);

        alternate()
            .current_dir(dir.path())
            .args([
                "--work-dir",
                "wd",
                "train",
                "--image-set",
                "2007_trainval+2012_trainval",
                "--rpn-epoch",
                "2",
                "--rcnn-epoch",
                "1",
            ])
            .assert()
            .success();

        assert!(work_dir.join("model/final-0000.params.json").exists());
        assert!(work_dir.join(".alternate/pipeline.state").exists());
        assert!(!dir.path().join("model").exists());
    }
}

// =============================================================================
// State Tests
// =============================================================================

mod state {
    use super::*;

    #[test]
    fn test_status_before_any_run() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Not started"));
    }

    #[test]
    fn test_reset_force_clears_state() {
        let dir = create_temp_workdir();
        setup_runners(&dir);
        alternate().args(train_args(&dir)).assert().success();
        assert!(dir.path().join(".alternate/pipeline.state").exists());

        alternate()
            .current_dir(dir.path())
            .args(["reset", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Reset complete"));

        assert!(!dir.path().join(".alternate/pipeline.state").exists());
        // checkpoints are left alone
        assert!(dir.path().join("model/final-0000.params.json").exists());
    }
}

// =============================================================================
// Combine Tests
// =============================================================================

mod combine {
    use super::*;

    fn write_params(dir: &Path, name: &str, content: &str) {
        let model = dir.join("model");
        fs::create_dir_all(&model).unwrap();
        fs::write(model.join(format!("{}.params.json", name)), content).unwrap();
    }

    #[test]
    fn test_combine_first_input_wins() {
        let dir = create_temp_workdir();
        write_params(
            dir.path(),
            "a-0001",
            r#"{"arg_params":{"conv":{"shape":[1],"data":[1.0]},"rpn":{"shape":[1],"data":[5.0]}}}"#,
        );
        write_params(
            dir.path(),
            "b-0002",
            r#"{"arg_params":{"conv":{"shape":[1],"data":[9.0]},"cls":{"shape":[1],"data":[7.0]}}}"#,
        );

        alternate()
            .current_dir(dir.path())
            .args([
                "combine",
                "--first",
                "model/a:1",
                "--second",
                "model/b:2",
                "--output",
                "model/c:0",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("c-0000.params.json"));

        let merged: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("model/c-0000.params.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(merged["arg_params"]["conv"]["data"][0], 1.0);
        assert_eq!(merged["arg_params"]["cls"]["data"][0], 7.0);
        assert_eq!(merged["arg_params"]["rpn"]["data"][0], 5.0);
    }

    #[test]
    fn test_combine_missing_input_fails() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args([
                "combine",
                "--first",
                "model/a:1",
                "--second",
                "model/b:2",
                "--output",
                "model/c:0",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));

        assert!(!dir.path().join("model/c-0000.params.json").exists());
    }

    #[test]
    fn test_combine_rejects_bad_reference() {
        alternate()
            .args([
                "combine",
                "--first",
                "model/a",
                "--second",
                "model/b:2",
                "--output",
                "model/c:0",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid --first"));
    }
}

// =============================================================================
// Submission Tests
// =============================================================================

mod submission {
    use super::*;

    #[test]
    fn test_submission_conversion() {
        let dir = create_temp_workdir();
        let input = dir.path().join("detections.json");
        let output = dir.path().join("out.txt");
        fs::write(
            &input,
            r#"[
                [[], []],
                [[[10, 20, 30, 40, 0.9]], []],
                [[], [[1, 2, 3, 4, 0.5], [5, 6, 7, 8, 0.25]]]
            ]"#,
        )
        .unwrap();

        alternate()
            .args([
                "submission",
                "--input",
                &input.display().to_string(),
                "--output",
                &output.display().to_string(),
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote 3 detections"));

        let text = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "1 1 0.900000 10.000000 20.000000 30.000000 40.000000",
                "2 2 0.500000 1.000000 2.000000 3.000000 4.000000",
                "2 2 0.250000 5.000000 6.000000 7.000000 8.000000",
            ]
        );
    }

    #[test]
    fn test_submission_default_output_name() {
        let dir = create_temp_workdir();
        fs::write(dir.path().join("d.json"), "[[[]],[[]]]").unwrap();

        alternate()
            .current_dir(dir.path())
            .args(["submission", "--input", "d.json"])
            .assert()
            .success();

        let text = fs::read_to_string(dir.path().join("detections_submission.txt")).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn test_submission_missing_input_fails() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["submission", "--input", "nope.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read detections"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_validate_warns_without_runners() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("runner.train_rpn is not set"));
    }

    #[test]
    fn test_config_validate_accepts_complete_file() {
        let dir = create_temp_workdir();
        setup_runners(&dir);

        alternate()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_show_includes_presets() {
        let dir = create_temp_workdir();

        alternate()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("model_prefix"))
            .stdout(predicate::str::contains("PascalVOC"));
    }

    #[test]
    fn test_config_parse_error_is_reported() {
        let dir = create_temp_workdir();
        fs::write(dir.path().join("alternate.toml"), "[runner\n").unwrap();

        alternate()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse config file"));
    }
}
