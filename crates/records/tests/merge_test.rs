use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tuna_records::{
    read_source, MergeArtifacts, MergeOutcome, MergeSummary, RecordMerger, ResolveMode,
};

const KEY: &str = "64-56-56-3x3-64-56-56-1-1x1-1x1-1x1-0-NCHW-FP32-F";

fn write_sources(dir: &TempDir, contents: &[&str]) -> Vec<PathBuf> {
    contents
        .iter()
        .enumerate()
        .map(|(i, content)| {
            let path = dir.path().join(format!("node-{:02}.txt", i + 1));
            std::fs::write(&path, content).unwrap();
            path
        })
        .collect()
}

async fn merge(paths: &[PathBuf], mode: ResolveMode) -> MergeOutcome {
    let mut merger = RecordMerger::new();
    for path in paths {
        let records = read_source(path).await.unwrap();
        merger.add_all(&records);
    }
    merger.resolve(mode)
}

async fn merge_to_dir(
    paths: &[PathBuf],
    mode: ResolveMode,
    out_dir: &Path,
) -> (MergeSummary, MergeArtifacts) {
    let artifacts = MergeArtifacts {
        commands: Some(out_dir.join("commands.txt")),
        ..MergeArtifacts::default()
    }
    .with_output(out_dir.join("merged.txt"));
    let outcome = merge(paths, mode).await;
    let summary = artifacts.write(&outcome).await.unwrap();
    (summary, artifacts)
}

fn read(path: &Option<PathBuf>) -> String {
    std::fs::read_to_string(path.as_ref().unwrap()).unwrap()
}

#[tokio::test]
async fn test_four_machine_scenario_off_reports_conflict() {
    let dir = TempDir::new().unwrap();
    let line = format!("{KEY}=id1:2,3\n");
    let odd = format!("{KEY}=id1:2,3,4\n");
    let paths = write_sources(&dir, &[&line, &line, &odd, &line]);

    let out = dir.path().join("out");
    let (summary, artifacts) = merge_to_dir(&paths, ResolveMode::Off, &out).await;
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.written, 0);

    // 唯一的子项冲突，主输出中没有该键
    assert_eq!(read(&artifacts.output), "");

    let report = read(&artifacts.conflicts);
    assert!(report.starts_with(&format!("Merge conflict at key {KEY}\n")));
    assert!(report.contains("Driver options to reproduce: MIOpenDriver conv -c 64 -H 56"));
    assert_eq!(report.matches(" from ").count(), 4);
    for i in 1..=4 {
        assert!(report.contains(&format!("node-{i:02}.txt:1")));
    }
    assert!(report.contains("\tid1:2,3,4 from "));

    let commands = read(&artifacts.conflict_commands);
    assert_eq!(commands.lines().count(), 1);
    assert!(commands.starts_with("MIOpenDriver conv "));
}

#[tokio::test]
async fn test_four_machine_scenario_auto_picks_most_fields() {
    let dir = TempDir::new().unwrap();
    let line = format!("{KEY}=id1:2,3\n");
    let odd = format!("{KEY}=id1:2,3,4\n");
    let paths = write_sources(&dir, &[&line, &line, &odd, &line]);

    let out = dir.path().join("out");
    let (summary, artifacts) = merge_to_dir(&paths, ResolveMode::Auto, &out).await;
    assert_eq!(summary.conflicts, 0);
    assert_eq!(summary.auto_resolved, 1);
    assert_eq!(read(&artifacts.output), format!("{KEY}=id1:2,3,4\n"));
    assert_eq!(read(&artifacts.conflicts), "");
}

#[tokio::test]
async fn test_identical_values_from_many_sources_merge_trivially() {
    let dir = TempDir::new().unwrap();
    let content = "k1=1:0.5,2;2:0.7,3\nk2=1:9\n";
    let paths = write_sources(&dir, &[content, content, content, content, content]);

    let outcome = merge(&paths, ResolveMode::Off).await;
    assert!(!outcome.has_conflicts());
    let summary = MergeSummary::from_outcome(&outcome);
    assert_eq!(summary.trivial, 2);
    assert_eq!(summary.written, 2);
    assert_eq!(
        outcome.keys[0].line().as_deref(),
        Some("k1=1:0.5,2;2:0.7,3")
    );
}

#[tokio::test]
async fn test_off_merge_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let paths = write_sources(
        &dir,
        &[
            "b=1:1\na=1:2,3;2:4\nbroken line\n",
            "a=1:2,4;2:4\r\nc=3:1\n",
            "a=2:4\n",
        ],
    );

    let first = dir.path().join("run1");
    let second = dir.path().join("run2");
    let (summary, run1) = merge_to_dir(&paths, ResolveMode::Off, &first).await;
    merge_to_dir(&paths, ResolveMode::Off, &second).await;
    // 同一目录再跑一次，文件被覆盖而不是追加
    let (_, rerun) = merge_to_dir(&paths, ResolveMode::Off, &first).await;

    assert_eq!(summary.conflicts, 1);
    assert_eq!(read(&run1.output), "a=2:4\nb=1:1\nc=3:1\n");
    for name in ["merged.txt", "merged.txt.conflicts", "merged.txt.options", "commands.txt"] {
        let a = std::fs::read(first.join(name)).unwrap();
        let b = std::fs::read(second.join(name)).unwrap();
        assert_eq!(a, b, "{name} differs between runs");
    }
    assert_eq!(read(&rerun.conflicts).matches("Merge conflict").count(), 1);
}

#[tokio::test]
async fn test_auto_tie_goes_to_earliest_source() {
    let dir = TempDir::new().unwrap();
    let paths = write_sources(&dir, &["k=1:3,4;2:1\n", "k=1:1,2;2:1,1\n"]);

    let outcome = merge(&paths, ResolveMode::Auto).await;
    assert_eq!(outcome.keys[0].line().as_deref(), Some("k=1:3,4;2:1,1"));
}

#[tokio::test]
async fn test_commands_dump_covers_every_key() {
    let dir = TempDir::new().unwrap();
    let other = KEY.replace("FP32-F", "FP16-B");
    let paths = write_sources(
        &dir,
        &[&format!("{KEY}=1:1\n{other}=1:2\nnot-a-conv-key=1:3\n")],
    );

    let out = dir.path().join("out");
    let (summary, artifacts) = merge_to_dir(&paths, ResolveMode::Off, &out).await;
    assert_eq!(summary.keys, 3);

    let commands = read(&artifacts.commands);
    let lines: Vec<&str> = commands.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("MIOpenDriver convfp16 "));
    assert!(lines[0].ends_with("-F 2"));
    assert!(lines[1].starts_with("MIOpenDriver conv "));
    // 无法解析的键写出原因而不中断
    assert!(lines[2].starts_with("# "));
}
