mod common;

use std::{cell::Cell, fs};

use common::{snapshot_names, Fixture, SIDE};
use pretty_assertions::assert_eq;
use training::{config::LastBatchPolicy, Trainer, TrainingError};

#[test]
fn first_epoch_runs_one_batch_each_and_writes_only_a_sample() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let config = fixture.config(3, "", "")?;
    let mut trainer = Trainer::new(config)?;

    assert_eq!(trainer.split().validation.len(), 2);
    assert_eq!(trainer.split().training.len(), 8);

    let summary = trainer.run_epoch(0)?;
    assert_eq!(summary.training_batches, 1);
    assert_eq!(summary.training_samples, 8);
    assert_eq!(summary.validation_batches, 1);
    assert_eq!(summary.validation_samples, 2);
    assert!(summary.validation_loss.is_finite());
    assert!(summary.validation_loss >= 0.0);
    assert!(summary.checkpoint.is_none());

    let sample = summary.sample.expect("sample written");
    assert_eq!(sample, fixture.samples_dir().join("epoch_0.png"));
    let decoded = image::open(&sample)?.to_luma8();
    assert_eq!(decoded.dimensions(), (SIDE, SIDE));
    assert!(decoded.pixels().all(|pixel| pixel.0[0] == 0 || pixel.0[0] == 255));

    assert!(snapshot_names(trainer.run_dir())?.is_empty());
    Ok(())
}

#[test]
fn final_epoch_is_checkpointed_and_training_resumes_after_it() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut trainer = Trainer::new(fixture.config(2, "", "")?)?;

    let report = trainer.train()?;
    assert!(!report.interrupted);
    assert_eq!(report.epochs.len(), 2);
    assert!(report.epochs[0].checkpoint.is_none());
    let snapshot = report.epochs[1].checkpoint.clone().expect("last epoch saved");
    assert_eq!(snapshot_names(&report.run_dir)?, vec!["unet-16-1".to_string()]);
    for file in ["model.safetensors", "optimizer.json", "manifest.json"] {
        assert!(snapshot.join(file).is_file(), "{file} missing");
    }

    let trained: Vec<(String, Vec<f32>)> = trainer
        .model()
        .network()
        .parameters()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
        .collect::<anyhow::Result<_>>()?;

    let mut resumed = Trainer::new(fixture.config(3, "", "")?)?;
    let descriptor = resumed.resume_from_path(&report.run_dir)?;
    assert_eq!(descriptor.directory, snapshot);
    assert_eq!(resumed.start_epoch(), 2);

    let restored: Vec<(String, Vec<f32>)> = resumed
        .model()
        .network()
        .parameters()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
        .collect::<anyhow::Result<_>>()?;
    assert_eq!(trained, restored);
    assert_eq!(
        resumed.model().optimizer().steps_taken(),
        trainer.model().optimizer().steps_taken()
    );

    let report = resumed.train()?;
    assert_eq!(report.epochs.len(), 1);
    assert_eq!(report.epochs[0].epoch, 2);
    assert!(report.epochs[0].checkpoint.is_some());
    Ok(())
}

#[test]
fn retention_keeps_only_the_newest_snapshots() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let config = fixture.config(5, "", "every_n_epochs = 1\nmax_keep = 2")?;
    let mut trainer = Trainer::new(config)?;

    let report = trainer.train()?;
    let saved: Vec<usize> = report
        .epochs
        .iter()
        .filter(|epoch| epoch.checkpoint.is_some())
        .map(|epoch| epoch.epoch)
        .collect();
    assert_eq!(saved, vec![1, 2, 3, 4]);
    assert_eq!(
        snapshot_names(&report.run_dir)?,
        vec!["unet-16-3".to_string(), "unet-16-4".to_string()]
    );
    Ok(())
}

#[test]
fn missing_mask_aborts_with_the_offending_identifier() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut trainer = Trainer::new(fixture.config(1, "", "")?)?;
    let victim = trainer.split().training[0].to_string();
    fs::remove_file(fixture.mask_path(&victim))?;

    let err = trainer.train().expect_err("read failure is fatal by default");
    assert!(matches!(err, TrainingError::SampleRead { .. }));
    assert!(!err.is_recoverable());
    assert!(err.to_string().contains(&victim));
    Ok(())
}

#[test]
fn skip_policy_drops_unreadable_samples() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let config = fixture.config(1, "on_read_error = \"skip\"", "")?;
    let mut trainer = Trainer::new(config)?;
    let victim = trainer.split().training[3].to_string();
    fs::remove_file(fixture.mask_path(&victim))?;

    let report = trainer.train()?;
    assert_eq!(report.epochs[0].training_samples, 7);
    assert_eq!(report.epochs[0].validation_samples, 2);
    Ok(())
}

#[test]
fn stop_flag_ends_training_at_a_boundary() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut config = fixture.config(50, "", "")?;
    config.data.batch_size = 4;
    let mut trainer = Trainer::new(config)?;

    // Allow the epoch check and the first two batch checks, then stop.
    let polls = Cell::new(0);
    let report = trainer.train_with_shutdown(|| {
        polls.set(polls.get() + 1);
        polls.get() > 3
    })?;

    assert!(report.interrupted);
    assert!(report.epochs.is_empty());
    assert_eq!(trainer.model().optimizer().steps_taken(), 2);
    assert!(snapshot_names(&report.run_dir)?.is_empty());
    Ok(())
}

#[test]
fn evaluation_does_not_change_the_model() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut trainer = Trainer::new(fixture.config(1, "", "")?)?;

    let snapshot = |trainer: &Trainer| -> anyhow::Result<Vec<Vec<f32>>> {
        trainer
            .model()
            .network()
            .parameters()
            .into_iter()
            .map(|(_, var)| Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
            .collect()
    };

    let before = snapshot(&trainer)?;
    let first = trainer.evaluate()?;
    let second = trainer.evaluate()?;
    assert_eq!(before, snapshot(&trainer)?);
    assert_eq!(first.average_loss, second.average_loss);
    assert_eq!(first.batches, 1);
    Ok(())
}

#[test]
fn manifest_without_rows_fails_before_training() -> anyhow::Result<()> {
    let fixture = Fixture::new(2)?;
    let config = fixture.config(1, "", "")?;
    fs::write(&config.data.manifest, "img,rle_mask\n")?;

    match Trainer::new(config) {
        Err(TrainingError::Manifest { reason, .. }) => assert!(reason.contains("no rows")),
        Err(other) => panic!("expected manifest error, got {other}"),
        Ok(_) => panic!("trainer built from an empty manifest"),
    }
    Ok(())
}

#[test]
fn drop_policy_still_validates_a_small_split() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut config = fixture.config(1, "", "")?;
    config.data.batch_size = 4;
    config.data.last_batch = LastBatchPolicy::Drop;
    let mut trainer = Trainer::new(config)?;

    let summary = trainer.run_epoch(0)?;
    assert_eq!(summary.training_batches, 2);
    assert_eq!(summary.training_samples, 8);
    assert_eq!(summary.validation_batches, 1);
    assert_eq!(summary.validation_samples, 2);
    assert!(summary.validation_loss.is_finite());
    Ok(())
}

#[test]
fn unwritable_checkpoint_and_sample_paths_do_not_stop_training() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let mut trainer = Trainer::new(fixture.config(2, "", "")?)?;

    let run_dir = trainer.run_dir().to_path_buf();
    fs::remove_dir(&run_dir)?;
    fs::write(&run_dir, b"occupied")?;
    fs::create_dir_all(fixture.path().join("sample_results"))?;
    fs::write(fixture.samples_dir(), b"occupied")?;

    let report = trainer.train()?;
    assert!(!report.interrupted);
    assert_eq!(report.epochs.len(), 2);
    for epoch in &report.epochs {
        assert!(epoch.checkpoint.is_none(), "epoch {} saved", epoch.epoch);
        assert!(epoch.sample.is_none(), "epoch {} sampled", epoch.epoch);
    }
    assert!(run_dir.is_file());
    Ok(())
}

#[test]
fn unusable_tensorboard_directory_does_not_block_training() -> anyhow::Result<()> {
    let fixture = Fixture::new(10)?;
    let blocker = fixture.path().join("not_a_dir");
    fs::write(&blocker, b"")?;
    let mut config = fixture.config(1, "", "")?;
    config.runtime.logging.tensorboard = Some(blocker.join("tb"));

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.run_epoch(0)?;
    assert_eq!(summary.validation_samples, 2);
    assert!(!blocker.join("tb").exists());
    Ok(())
}
