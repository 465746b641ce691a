use super::*;

fn labels(record: &Record) -> Vec<(String, &'static str)> {
  record.attempts.iter().map(|a| (a.provider.clone(), a.outcome.label())).collect()
}

fn pdf_in(dir: &TempDir) -> PathBuf {
  let path = dir.path().join("source.pdf");
  std::fs::write(&path, b"%PDF-1.5\n% scripted\n").unwrap();
  path
}

#[tokio::test]
async fn falls_back_in_priority_order() -> TestResult {
  let dir = tempdir()?;
  let a = ScriptedProvider::new("a", Lookup::NotFound);
  let b = ScriptedProvider::new("b", found(&pdf_in(&dir)));
  let c = ScriptedProvider::new("c", Lookup::NotFound);
  let chain = chain(vec![a.clone(), b.clone(), c.clone()], &dir.path().join("artifacts"), 3);

  let mut record = Record::new(entry("Soil carbon", 2020, Some("10.1000/x")));
  let result = chain.acquire(&mut record, "r1", false).await;

  let AcquisitionResult::Acquired(artifact) = result else { panic!("expected an artifact") };
  assert_eq!(artifact.provider, "b");
  assert!(artifact.path.exists());
  assert_eq!(labels(&record), vec![("a".into(), "not_found"), ("b".into(), "success")]);
  assert_eq!(c.calls(), 0);
  Ok(())
}

#[tokio::test]
async fn rate_limited_providers_are_retried_a_bounded_number_of_times() -> TestResult {
  let dir = tempdir()?;
  let limited = ScriptedProvider::new("limited", Lookup::RateLimited { retry_after: None });
  let chain = chain(vec![limited.clone()], &dir.path().join("artifacts"), 3);

  let mut record = Record::new(entry("Soil carbon", 2020, None));
  let result = chain.acquire(&mut record, "r1", false).await;

  assert_eq!(result, AcquisitionResult::Exhausted { providers: vec!["limited".into()] });
  assert_eq!(limited.calls(), 3);
  assert_eq!(record.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);

  // The same run resumed later has no attempts left for the pair.
  let result = chain.acquire(&mut record, "r1", false).await;
  assert!(matches!(result, AcquisitionResult::Exhausted { .. }));
  assert_eq!(limited.calls(), 3);

  // The spent budget is recorded as terminal, so a new run leaves the pair alone too.
  assert_eq!(labels(&record).last().unwrap().1, "exhausted");
  let mut record: Record = serde_json::from_str(&serde_json::to_string(&record)?)?;
  chain.acquire(&mut record, "r2", false).await;
  assert_eq!(limited.calls(), 3);
  Ok(())
}

#[tokio::test]
async fn terminal_outcomes_survive_a_checkpoint_round_trip() -> TestResult {
  let dir = tempdir()?;
  let a = ScriptedProvider::new("a", Lookup::NotFound);
  let b = ScriptedProvider::new("b", Lookup::Error(CallError::Permanent("403".into())));
  let chain = chain(vec![a.clone(), b.clone()], &dir.path().join("artifacts"), 3);

  let mut record = Record::new(entry("Soil carbon", 2020, None));
  chain.acquire(&mut record, "r1", false).await;
  let mut record: Record = serde_json::from_str(&serde_json::to_string(&record)?)?;

  chain.acquire(&mut record, "r1", false).await;
  chain.acquire(&mut record, "r2", false).await;
  assert_eq!((a.calls(), b.calls()), (1, 1));
  assert_eq!(record.attempts.len(), 2);

  chain.acquire(&mut record, "r2", true).await;
  assert_eq!((a.calls(), b.calls()), (2, 2));
  Ok(())
}

#[traced_test]
#[tokio::test]
async fn deep_analysis_queues_unacquirable_records() -> TestResult {
  let (dir, store) = temp();
  let pdf = write_pdf(&dir.path().join("open.pdf"), "Stocks were 12 kg per square metre");

  let batch = records(vec![
    entry("Open access carbon paper", 2022, Some("10.1000/open")),
    entry("Paywalled carbon paper", 2021, Some("10.1000/closed")),
  ]);
  let open_id = batch[0].id.clone();
  let closed_id = batch[1].id.clone();

  let aggregator = ScriptedProvider::new("aggregator", Lookup::NotFound)
    .script(&open_id, vec![found(&pdf)]);
  let proxy = ScriptedProvider::new("proxy", Lookup::NotFound);
  let config = PipelineConfig { deep_analysis: true, analyze_top: 10, ..pipeline() };
  let model = Arc::new(FakeModel::default());
  let chain = chain(vec![aggregator.clone(), proxy.clone()], &dir.path().join("artifacts"), 2);

  let summary = scheduler(store.clone(), &config, model.clone(), Some(chain))
    .run(&RunOptions::new("r1"), Some(batch))
    .await?;
  assert_eq!(summary.done, 1);
  assert_eq!(summary.failed, 1);
  assert_eq!(summary.manual_queue, 1);

  let checkpoint = store.load("r1").await?.unwrap();
  let open = checkpoint.record(&open_id).unwrap();
  let analysis = open.output(Stage::Analyze).unwrap();
  assert_eq!(analysis["full_text"]["result"]["key_results"][0], "stocks decline with depth");
  assert_eq!(analysis["artifact"]["provider"], "aggregator");

  let closed = checkpoint.record(&closed_id).unwrap();
  assert_eq!(
    closed.status(),
    &Status::Failed { stage: Stage::Analyze, reason: "exhausted".into() }
  );
  assert_eq!(checkpoint.manual_queue[0].id, closed_id);
  assert_eq!(checkpoint.manual_queue[0].providers, vec!["aggregator", "proxy"]);
  assert_eq!(labels(closed), vec![("aggregator".into(), "not_found"), ("proxy".into(), "not_found")]);
  Ok(())
}

#[tokio::test]
async fn forced_reruns_do_not_redispatch_without_force_acquire() -> TestResult {
  let (dir, store) = temp();
  let batch = records(vec![entry("Paywalled carbon paper", 2021, Some("10.1000/closed"))]);
  let config = PipelineConfig { deep_analysis: true, ..pipeline() };
  let provider = ScriptedProvider::new("aggregator", Lookup::NotFound);
  let artifacts = dir.path().join("artifacts");

  scheduler(
    store.clone(),
    &config,
    Arc::new(FakeModel::default()),
    Some(chain(vec![provider.clone()], &artifacts, 2)),
  )
  .run(&RunOptions::new("r1"), Some(batch))
  .await?;
  assert_eq!(provider.calls(), 1);

  let rerun = RunOptions::new("r1").with_stages(vec![Stage::Analyze, Stage::Report]).with_force(true);
  let summary = scheduler(
    store.clone(),
    &config,
    Arc::new(FakeModel::default()),
    Some(chain(vec![provider.clone()], &artifacts, 2)),
  )
  .run(&rerun, None)
  .await?;
  assert_eq!(provider.calls(), 1);
  assert_eq!(summary.manual_queue, 1);

  let summary = scheduler(
    store.clone(),
    &config,
    Arc::new(FakeModel::default()),
    Some(chain(vec![provider.clone()], &artifacts, 2)),
  )
  .run(&rerun.clone().with_force_acquire(true), None)
  .await?;
  assert_eq!(provider.calls(), 2);
  assert_eq!(summary.manual_queue, 1);
  Ok(())
}
