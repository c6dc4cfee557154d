use ndarray::{array, Array2};
use seq_autoencoder::metrics::{exact_match_accuracy, token_accuracy};
use seq_autoencoder::{
    AutoEncoder, AutoEncoderConfig, CellKind, CheckpointError, ConfigError, Error, KlSchedule,
    TrainOptions, DECODER, EMBEDDINGS, ENCODER,
};

const VOCAB: usize = 10;
const LEN: usize = 4;

fn toy_config() -> AutoEncoderConfig {
    AutoEncoderConfig {
        rnn_size: 32,
        embedding_size: 12,
        learning_rate: Some(0.01),
        seed: 42,
        ..AutoEncoderConfig::new(VOCAB, LEN)
    }
}

fn toy_data() -> Array2<usize> {
    array![
        [1, 2, 3, 4],
        [5, 6, 7, 8],
        [9, 1, 5, 0],
        [3, 3, 8, 2],
    ]
}

#[test]
fn fresh_model_reconstructs_with_valid_shape_and_range() {
    let mut model = AutoEncoder::new(toy_config()).unwrap();
    let x = toy_data();
    let out = model.reconstruct(x.view(), Some(3)).unwrap();
    assert_eq!(out.dim(), x.dim());
    assert!(out.iter().all(|&t| t < VOCAB));
}

#[test]
fn separate_halves_compose_on_fresh_parameters() {
    let mut enc = AutoEncoder::new(AutoEncoderConfig { decoder: false, ..toy_config() }).unwrap();
    let mut dec = AutoEncoder::new(AutoEncoderConfig { encoder: false, ..toy_config() }).unwrap();
    let x = toy_data();
    let codes = enc.encode(x.view(), None).unwrap();
    assert_eq!(codes.dim(), (4, 32));
    let out = dec.decode(codes.view(), Some(1)).unwrap();
    assert_eq!(out.dim(), (4, LEN));
    assert!(out.iter().all(|&t| t < VOCAB));
}

#[test]
fn training_improves_reconstruction() {
    let mut model = AutoEncoder::new(toy_config()).unwrap();
    let x = toy_data();

    let before = model.reconstruct(x.view(), None).unwrap();
    let exact_before = exact_match_accuracy(before.view(), x.view()).unwrap();
    let tokens_before = token_accuracy(before.view(), x.view()).unwrap();
    let loss_before = model.evaluate(x.view(), None, 0.0).unwrap().total;

    let one_epoch = TrainOptions { num_epochs: 1, batch_size: 2, ..Default::default() };
    let mut exact = vec![exact_before];
    let mut first_loss = None;
    for _ in 0..50 {
        let report = model.train(x.view(), &one_epoch).unwrap();
        first_loss.get_or_insert(report.epochs[0].train.total);
        let out = model.reconstruct(x.view(), None).unwrap();
        exact.push(exact_match_accuracy(out.view(), x.view()).unwrap());
    }
    for pair in exact.windows(2) {
        assert!(pair[1] >= pair[0], "exact match regressed: {:?}", exact);
    }
    assert!(exact[50] > exact[0], "exact match never improved: {:?}", exact);

    let options = TrainOptions { num_epochs: 150, batch_size: 2, ..Default::default() };
    let report = model.train(x.view(), &options).unwrap();
    assert_eq!(report.epochs.len(), 150);
    assert_eq!(report.predictions.dim(), x.dim());
    assert_eq!(model.epochs_trained(), 200);
    assert_eq!(report.epochs.last().unwrap().epoch, 200);

    let after = model.reconstruct(x.view(), None).unwrap();
    let exact_after = exact_match_accuracy(after.view(), x.view()).unwrap();
    let tokens_after = token_accuracy(after.view(), x.view()).unwrap();
    let loss_after = model.evaluate(x.view(), None, 0.0).unwrap().total;

    assert!(loss_after < loss_before * 0.5, "loss {} -> {}", loss_before, loss_after);
    assert!(tokens_after > tokens_before, "token accuracy {} -> {}", tokens_before, tokens_after);
    assert!(exact_after >= exact_before);
    assert!(exact_after >= 0.5, "exact match after training: {}", exact_after);

    let last = report.epochs.last().unwrap().train.total;
    assert!(last < first_loss.unwrap());
}

#[test]
fn diverging_training_reports_non_finite_loss() {
    let config = AutoEncoderConfig { variational: true, learning_rate: Some(1e30), ..toy_config() };
    let mut model = AutoEncoder::new(config).unwrap();
    let x = toy_data();
    let err = model.train(x.view(), &TrainOptions { num_epochs: 3, batch_size: 1, ..Default::default() });
    assert!(matches!(err, Err(Error::NonFiniteLoss { .. })), "{:?}", err.map(|r| r.epochs.len()));
    assert!(model.epochs_trained() < 3);
}

#[test]
fn weight_decay_and_clipping_keep_training_stable() {
    let config = AutoEncoderConfig {
        weight_decay: 0.01,
        max_grad_norm: Some(1.0),
        ..toy_config()
    };
    let mut model = AutoEncoder::new(config).unwrap();
    let x = toy_data();
    let loss_before = model.evaluate(x.view(), None, 0.0).unwrap().total;

    let report = model.train(x.view(), &TrainOptions { num_epochs: 30, batch_size: 2, ..Default::default() }).unwrap();
    assert_eq!(report.epochs.len(), 30);
    for stats in &report.epochs {
        assert!(stats.train.total.is_finite());
        assert!(stats.grad_norm.is_finite() && stats.grad_norm > 0.0);
    }
    let loss_after = model.evaluate(x.view(), None, 0.0).unwrap().total;
    assert!(loss_after < loss_before, "loss {} -> {}", loss_before, loss_after);

    // Decay alone pulls every weight toward zero when gradients vanish.
    let decayed = AutoEncoderConfig { weight_decay: 0.5, max_grad_norm: Some(1e-12), ..toy_config() };
    let mut shrinking = AutoEncoder::new(decayed).unwrap();
    let norm = |m: &AutoEncoder| -> f32 {
        m.parameter_values(ENCODER).values().flat_map(|a| a.iter().map(|v| v * v)).sum()
    };
    let before = norm(&shrinking);
    shrinking.train(x.view(), &TrainOptions { num_epochs: 2, batch_size: 4, ..Default::default() }).unwrap();
    assert!(norm(&shrinking) < before);
}

#[test]
fn variational_training_reports_annealed_kl() {
    let config = AutoEncoderConfig { variational: true, cell: CellKind::Lstm, ..toy_config() };
    let mut model = AutoEncoder::new(config).unwrap();
    let x = toy_data();
    let validation = x.slice(ndarray::s![..2, ..]);
    let options = TrainOptions {
        num_epochs: 4,
        batch_size: 3,
        keep_prob: 0.9,
        kl_schedule: Some(KlSchedule { start: 0.0, increase: 0.5, max: 1.0 }),
        validation: Some(validation),
        ..Default::default()
    };
    let report = model.train(x.view(), &options).unwrap();
    let weights: Vec<f32> = report.epochs.iter().map(|e| e.kl_weight).collect();
    assert_eq!(weights, vec![0.0, 0.5, 1.0, 1.0]);
    for stats in &report.epochs {
        assert!(stats.train.total.is_finite());
        assert!(stats.train.kl_divergence >= 0.0);
        let val = stats.validation.unwrap();
        assert!(val.kl_divergence >= 0.0);
    }

    // Inference codes are the posterior mean: repeated encodes agree.
    let enc_config = AutoEncoderConfig { decoder: false, variational: true, cell: CellKind::Lstm, ..toy_config() };
    let mut enc = AutoEncoder::new(enc_config).unwrap();
    assert_eq!(enc.encode(x.view(), None).unwrap(), enc.encode(x.view(), None).unwrap());
}

#[test]
fn restoring_embeddings_leaves_other_scopes_alone() {
    let dir = tempfile::tempdir().unwrap();
    let x = toy_data();

    let mut trained = AutoEncoder::new(AutoEncoderConfig {
        save_dir: Some(dir.path().to_path_buf()),
        ..toy_config()
    }).unwrap();
    trained.train(x.view(), &TrainOptions { num_epochs: 3, batch_size: 2, ..Default::default() }).unwrap();

    let mut fresh = AutoEncoder::new(AutoEncoderConfig {
        save_dir: Some(dir.path().to_path_buf()),
        seed: 7,
        ..toy_config()
    }).unwrap();
    let encoder_before = fresh.parameter_values(ENCODER);
    let decoder_before = fresh.parameter_values(DECODER);
    assert_ne!(fresh.parameter_values(EMBEDDINGS), trained.parameter_values(EMBEDDINGS));

    let step = fresh.restore_scope(EMBEDDINGS).unwrap();
    assert_eq!(step, 3);
    assert_eq!(fresh.parameter_values(EMBEDDINGS), trained.parameter_values(EMBEDDINGS));
    assert_eq!(fresh.parameter_values(ENCODER), encoder_before);
    assert_eq!(fresh.parameter_values(DECODER), decoder_before);
}

#[test]
fn split_instances_recover_the_jointly_trained_model() {
    let dir = tempfile::tempdir().unwrap();
    let x = toy_data();

    let mut full = AutoEncoder::new(AutoEncoderConfig {
        save_dir: Some(dir.path().to_path_buf()),
        ..toy_config()
    }).unwrap();
    full.train(x.view(), &TrainOptions { num_epochs: 2, batch_size: 4, ..Default::default() }).unwrap();
    let expected = full.reconstruct(x.view(), None).unwrap();

    let saved = AutoEncoderConfig::load(dir.path()).unwrap();
    let mut enc = AutoEncoder::new(AutoEncoderConfig {
        decoder: false,
        learning_rate: None,
        load_from_save: true,
        seed: 100,
        ..saved.clone()
    }).unwrap();
    let mut dec = AutoEncoder::new(AutoEncoderConfig {
        encoder: false,
        learning_rate: None,
        load_from_save: true,
        seed: 200,
        ..saved
    }).unwrap();
    assert_eq!(enc.epochs_trained(), 2);

    let codes = enc.encode(x.view(), None).unwrap();
    assert_eq!(dec.decode(codes.view(), None).unwrap(), expected);
}

#[test]
fn epoch_checkpoints_respect_retention() {
    let dir = tempfile::tempdir().unwrap();
    let x = toy_data();
    let mut model = AutoEncoder::new(AutoEncoderConfig {
        save_dir: Some(dir.path().to_path_buf()),
        max_to_keep: 2,
        ..toy_config()
    }).unwrap();
    model.train(x.view(), &TrainOptions { num_epochs: 5, batch_size: 4, ..Default::default() }).unwrap();

    let mgr = seq_autoencoder::CheckpointManager::new(dir.path(), 2);
    let index = mgr.read_index().unwrap().unwrap();
    assert_eq!(index.steps, vec![4, 5]);
    assert!(!mgr.snapshot_path(3).exists());
}

#[test]
fn loading_from_an_empty_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = AutoEncoder::new(AutoEncoderConfig {
        save_dir: Some(dir.path().to_path_buf()),
        load_from_save: true,
        ..toy_config()
    }).err().unwrap();
    assert!(matches!(err, Error::Checkpoint(CheckpointError::NotFound { .. })));
}

#[test]
fn construction_rejects_bad_configurations() {
    let none = AutoEncoderConfig { encoder: false, decoder: false, ..toy_config() };
    assert!(matches!(AutoEncoder::new(none).err(), Some(Error::Config(ConfigError::NothingToBuild))));

    let mismatch = AutoEncoderConfig { encoder_size: Some(16), ..toy_config() };
    assert!(matches!(
        AutoEncoder::new(mismatch).err(),
        Some(Error::Config(ConfigError::LatentSizeMismatch { encoder: 16, decoder: 32 }))
    ));
}
