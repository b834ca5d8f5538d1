#![no_main]

use archiver_core::middleware::verify_signature;
use archiver_types::Secret;
use hmac::{Hmac, Mac};
use libfuzzer_sys::fuzz_target;
use sha2::Sha256;

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    secret: String,
    body: Vec<u8>,
    tamper: bool,
}

fuzz_target!(|input: Input| {
    if input.secret.is_empty() {
        return;
    }
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(input.secret.as_bytes()) else {
        return;
    };
    mac.update(&input.body);
    let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let body = if input.tamper {
        let mut tampered = input.body.clone();
        tampered.push(0xff);
        tampered
    } else {
        input.body.clone()
    };

    let secrets = vec![Secret::new(input.secret.clone())];
    let verified = verify_signature(&secrets, &header, &body);
    assert_eq!(verified, !input.tamper, "HMAC verification must flip exactly with a tampered body");
});
