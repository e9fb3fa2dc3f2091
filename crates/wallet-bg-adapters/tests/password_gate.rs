use wallet_bg_adapters::{KdfAlgorithm, KdfParams, PasswordGate};
use wallet_bg_core::{PasswordGatePort, PortError};

fn fast() -> KdfParams {
    KdfParams {
        memory_kib: 8,
        iterations: 1,
    }
}

#[test]
fn correct_password_passes_and_wrong_one_is_refused() {
    let gate = PasswordGate::create("correct horse", fast()).expect("create");
    assert_eq!(gate.record().kdf_algorithm, KdfAlgorithm::Argon2idV1);

    gate.verify("correct horse").expect("verify");
    let err = gate.verify("battery staple").expect_err("wrong password");
    assert!(matches!(err, PortError::Policy(_)));
}

#[test]
fn salts_differ_between_gates() {
    let a = PasswordGate::create("same", fast()).expect("a");
    let b = PasswordGate::create("same", fast()).expect("b");
    assert_ne!(a.record().salt, b.record().salt);
    assert_ne!(a.record().verifier, b.record().verifier);
}

#[test]
fn empty_password_is_rejected() {
    let err = PasswordGate::create("", fast()).expect_err("empty");
    assert!(matches!(err, PortError::Validation(_)));
}

#[tokio::test]
async fn record_survives_save_and_load() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("password.json");
    let gate = PasswordGate::create("hunter2", fast()).expect("create");

    gate.save(&path).await.expect("save");
    let loaded = PasswordGate::load(&path).await.expect("load");

    assert_eq!(loaded.record(), gate.record());
    loaded.verify("hunter2").expect("verify after load");
}
