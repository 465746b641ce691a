use super::*;

#[traced_test]
#[tokio::test]
async fn corrupt_checkpoints_are_archived_and_the_run_starts_over() -> TestResult {
  let (_dir, store) = temp();
  let path = store.path_for("r1");
  std::fs::create_dir_all(path.parent().unwrap())?;
  std::fs::write(&path, b"{\"version\": 1, \"run_id\": \"r1\", \"recor")?;

  let summary = scheduler(store.clone(), &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(records(vec![entry("Carbon", 2020, None)])))
    .await?;
  assert_eq!(summary.done, 1);
  assert!(logs_contain("archived"));

  let archived: Vec<_> = std::fs::read_dir(path.parent().unwrap())?
    .filter_map(|e| e.ok())
    .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
    .collect();
  assert_eq!(archived.len(), 1);
  Ok(())
}

#[tokio::test]
async fn leftover_temp_files_do_not_affect_resume() -> TestResult {
  let (_dir, store) = temp();
  let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess]);
  scheduler(store.clone(), &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&options, Some(records(vec![entry("Carbon", 2020, None)])))
    .await?;

  // A save killed before its rename leaves a partial temp file beside the checkpoint.
  let dir = store.run_dir("r1");
  std::fs::write(dir.join(".checkpoint.killed.tmp"), b"{\"version\": 1, \"run_")?;

  let checkpoint = store.load("r1").await?.unwrap();
  assert_eq!(checkpoint.stage_cursor, 1);
  assert_eq!(store.latest().await?, Some("r1".to_string()));
  Ok(())
}

#[tokio::test]
async fn checkpoints_for_other_runs_are_refused() -> TestResult {
  let (_dir, store) = temp();
  let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess]);
  scheduler(store.clone(), &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&options, Some(records(vec![entry("Carbon", 2020, None)])))
    .await?;
  std::fs::create_dir_all(store.run_dir("r2"))?;
  std::fs::copy(store.path_for("r1"), store.path_for("r2"))?;

  let err = scheduler(store.clone(), &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r2"), None)
    .await
    .unwrap_err();
  assert!(matches!(err, SifterError::AmbiguousCheckpoint { .. }));
  Ok(())
}

#[tokio::test]
async fn status_lookups_follow_saves() -> TestResult {
  let (_dir, store) = temp();
  let batch = records(vec![entry("Carbon", 2020, None)]);
  let id = batch[0].id.clone();
  scheduler(store.clone(), &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch))
    .await?;
  assert_eq!(store.record_status(&id).await, Some(Status::Done));
  Ok(())
}
