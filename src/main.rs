//! Minimal CLI demo: register a device against CUCM and place or wait for
//! one call, printing every [`cucm_softphone::events::Event`] as it arrives.
//! Audio is a silent source/sink unless built with the `cpal-device`
//! feature.

use std::net::Ipv4Addr;

use cucm_softphone::audio::{AudioSink, AudioSource};
use cucm_softphone::events::Event;
use cucm_softphone::profile::{CertStore, DeviceProfile, PhoneConfig};
use cucm_softphone::Phone;

struct SilentSource;
impl AudioSource for SilentSource {
    fn read(&mut self, samples: usize) -> std::io::Result<Vec<i16>> {
        std::thread::sleep(std::time::Duration::from_millis(20));
        Ok(vec![0i16; samples])
    }
}

struct NullSink;
impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[i16]) -> std::io::Result<()> {
        Ok(())
    }
}

fn build_source_sink() -> (Box<dyn AudioSource>, Box<dyn AudioSink>) {
    #[cfg(feature = "cpal-device")]
    {
        use cucm_softphone::audio::cpal_device::{CpalSink, CpalSource};
        if let (Ok(src), Ok(sink)) = (CpalSource::default_device(48000), CpalSink::default_device(48000)) {
            return (Box::new(src), Box::new(sink));
        }
        tracing::warn!("no audio device available, falling back to silent source/sink");
    }
    (Box::new(SilentSource), Box::new(NullSink))
}

fn main() {
    let _guard = cucm_softphone::init_logging("./logs");

    let mut args = std::env::args().skip(1);
    let cucm_host = args.next().unwrap_or_else(|| "cucm.example.com".to_string());
    let line_number = args.next().unwrap_or_else(|| "9100".to_string());
    let dial_number = args.next();

    let profile = DeviceProfile {
        cucm_host,
        sip_port: 5060,
        sips_port: 5061,
        line_number: line_number.clone(),
        display_name: "Softphone Demo".to_string(),
        device_name: format!("SEP{:012X}", 0x001122334455u64),
        contact_id: line_number,
        security_mode: Default::default(),
        expected_cert_md5: None,
        capf_servers: vec![],
    };
    let certs = CertStore { client_cert_dir: "./certs/client".into(), server_cert_dir: "./certs/server".into() };
    let config = PhoneConfig::new(profile, certs);

    let (tx, rx) = cucm_softphone::event_channel();
    let printer = std::thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            println!("{event:?}");
            if matches!(event, Event::CallClosed) {
                break;
            }
        }
    });

    let phone = match Phone::new(&config, Ipv4Addr::new(0, 0, 0, 0), 48000, tx) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to connect: {e}");
            return;
        }
    };

    if let Err(e) = phone.register(false) {
        eprintln!("registration failed: {e}");
        return;
    }

    if let Some(number) = dial_number {
        let (source, sink) = build_source_sink();
        if let Err(e) = phone.call(&number, source, sink) {
            eprintln!("call failed: {e}");
        }
    } else {
        println!("registered; waiting for an incoming call (Ctrl+C to quit)");
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }

    phone.shutdown();
    drop(phone);
    let _ = printer.join();
}
