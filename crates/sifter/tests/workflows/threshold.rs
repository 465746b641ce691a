use super::*;

fn batch(garbage: usize) -> Vec<Record> {
  records(
    (0..10)
      .map(|i| {
        let title =
          if i < garbage { format!("Garbage paper {i}") } else { format!("Carbon paper {i}") };
        entry(&title, 2010 + i as i32, None)
      })
      .collect(),
  )
}

#[traced_test]
#[tokio::test]
async fn sixth_failure_out_of_ten_halts_the_run() -> TestResult {
  let (_dir, store) = temp();
  let config = PipelineConfig { concurrency: 1, ..pipeline() };

  let err = scheduler(store.clone(), &config, Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch(6)))
    .await
    .unwrap_err();
  assert!(matches!(err, SifterError::FatalThreshold { failed: 6, total: 10, .. }));
  assert!(logs_contain("Run halted"));

  let checkpoint = store.load("r1").await?.unwrap();
  assert!(checkpoint.records.iter().all(|r| !r.status().is_in_flight()));
  assert_eq!(checkpoint.terminal_counts()["failed"], 6);
  Ok(())
}

#[tokio::test]
async fn five_failures_out_of_ten_complete_normally() -> TestResult {
  let (_dir, store) = temp();
  let summary = scheduler(store, &pipeline(), Arc::new(FakeModel::default()), None)
    .run(&RunOptions::new("r1"), Some(batch(5)))
    .await?;
  assert_eq!(summary.failed, 5);
  assert_eq!(summary.done, 5);
  Ok(())
}

#[tokio::test]
async fn a_halted_run_stays_halted_until_forced() -> TestResult {
  let (_dir, store) = temp();
  let config = PipelineConfig { concurrency: 1, ..pipeline() };
  let model = Arc::new(FakeModel::default());
  scheduler(store.clone(), &config, model.clone(), None)
    .run(&RunOptions::new("r1"), Some(batch(6)))
    .await
    .unwrap_err();

  let resumed = scheduler(store.clone(), &config, model.clone(), None);
  let calls = model.calls();
  let err = resumed.run(&RunOptions::new("r1"), None).await.unwrap_err();
  assert!(matches!(err, SifterError::FatalThreshold { .. }));
  assert_eq!(model.calls(), calls);
  Ok(())
}
