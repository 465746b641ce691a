use super::*;

fn batch() -> Vec<Record> {
  records(vec![
    entry("Deep soil carbon under grassland", 2021, Some("10.1000/a")),
    entry("Urban heat islands (reject)", 2020, Some("10.1000/b")),
    entry("Carbon saturation in clay soils", 2019, None),
    entry("Subsoil carbon in the tropics", 2018, Some("10.1000/d")),
    entry("Garbage reply bait", 2017, None),
    entry("Biochar and soil carbon", 2016, Some("10.1000/f")),
  ])
}

#[traced_test]
#[tokio::test]
async fn interrupted_runs_converge_on_the_same_result() -> TestResult {
  let config = pipeline();

  let (_a, uninterrupted) = temp();
  scheduler(uninterrupted.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch()))
    .await?;
  let expected = statuses(&uninterrupted, "r1").await;

  let (_b, store) = temp();
  let shutdown = Shutdown::default();
  let interrupt =
    Arc::new(InterruptAfter { after: 7, seen: AtomicUsize::new(0), shutdown: shutdown.clone() });
  let summary = scheduler(store.clone(), &config, Arc::new(FakeModel::default()), None)
    .with_shutdown(shutdown)
    .with_reporter(interrupt)
    .run(&RunOptions::new("r1"), Some(batch()))
    .await?;
  assert!(summary.interrupted);
  assert!(summary.unfinished > 0);
  assert!(logs_contain("Run interrupted"));

  let model = Arc::new(FakeModel::default());
  let summary = scheduler(store.clone(), &config, model.clone(), None)
    .run(&RunOptions::new("r1"), None)
    .await?;
  assert!(!summary.interrupted);
  assert_eq!(summary.unfinished, 0);
  assert_eq!(statuses(&store, "r1").await, expected);
  Ok(())
}

#[traced_test]
#[tokio::test]
async fn records_caught_in_flight_are_revalidated() -> TestResult {
  let config = pipeline();
  let (_a, uninterrupted) = temp();
  scheduler(uninterrupted.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch()))
    .await?;
  let expected = statuses(&uninterrupted, "r1").await;

  // A crash after the screen stage started for one record leaves it in progress on disk.
  let (_b, store) = temp();
  let options = RunOptions::new("r1").with_stages(vec![Stage::Preprocess]);
  scheduler(store.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&options, Some(batch()))
    .await?;
  let path = store.path_for("r1");
  let mut json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
  json["records"][0]["status"] = serde_json::json!({ "state": "in_progress", "stage": "screen" });
  std::fs::write(&path, serde_json::to_vec(&json)?)?;

  scheduler(store.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), None)
    .await?;
  assert!(logs_contain("Re-validated 1 records"));
  assert_eq!(statuses(&store, "r1").await, expected);
  Ok(())
}

#[tokio::test]
async fn resuming_a_finished_run_does_no_work() -> TestResult {
  let config = pipeline();
  let (_dir, store) = temp();
  scheduler(store.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch()))
    .await?;

  let model = Arc::new(FakeModel::default());
  let summary = scheduler(store.clone(), &config, model.clone(), None)
    .run(&RunOptions::new("r1"), None)
    .await?;
  assert_eq!(model.calls(), 0);
  assert_eq!(summary.done, 4);
  assert_eq!(summary.skipped, 1);
  assert_eq!(summary.failed, 1);
  Ok(())
}
