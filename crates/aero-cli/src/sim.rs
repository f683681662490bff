//! Ground-test sender: emits synthetic datagrams at a fixed rate so the
//! ingestion side can be exercised without flight hardware.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use aero_proto::{encode, Barometric, TelemetrySample, Vector3};

const SEA_LEVEL_PA: f32 = 101_325.0;
const SEA_LEVEL_C: f32 = 15.0;
const LAPSE_RATE_C_PER_M: f32 = 0.0065;
const GRAVITY: f32 = 9.81;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub target: SocketAddr,
    pub count: Option<u64>,
    pub interval: Duration,
    /// Flip a CRC bit in every Nth datagram.
    pub corrupt_every: Option<u64>,
}

/// Slow climb with sensor noise on top.
#[derive(Debug, Default)]
struct Walk {
    altitude_m: f32,
    climb_mps: f32,
}

impl Walk {
    fn next(&mut self, rng: &mut StdRng, message_id: u8, dt: f32) -> TelemetrySample {
        self.climb_mps = (self.climb_mps + rng.gen_range(-0.2..0.2)).clamp(-5.0, 5.0);
        self.altitude_m = (self.altitude_m + self.climb_mps * dt).max(0.0);

        let h = self.altitude_m;
        TelemetrySample {
            message_id,
            acceleration: Vector3::new(
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.3..0.3),
                GRAVITY + rng.gen_range(-0.3..0.3),
            ),
            angular_rate: Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
            ),
            barometric: Barometric {
                // ISA troposphere
                pressure: SEA_LEVEL_PA * (1.0 - 2.25577e-5 * h).powf(5.25588),
                temperature: SEA_LEVEL_C - LAPSE_RATE_C_PER_M * h,
                altitude: h,
            },
        }
    }
}

pub async fn send(opts: SendOptions) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind sender socket")?;
    info!("send: emitting to {} every {:?}", opts.target, opts.interval);

    let mut rng = StdRng::from_entropy();
    let mut walk = Walk::default();
    let mut tick = tokio::time::interval(opts.interval);
    let dt = opts.interval.as_secs_f32();
    let mut sent = 0u64;

    while opts.count.map_or(true, |n| sent < n) {
        tick.tick().await;
        let sample = walk.next(&mut rng, sent as u8, dt);
        let mut buf = encode(&sample);
        if opts.corrupt_every.is_some_and(|n| n > 0 && (sent + 1) % n == 0) {
            buf[38] ^= 0x01;
            debug!("send: corrupting datagram {}", sent);
        }
        socket.send_to(&buf, opts.target).await.context("send datagram")?;
        sent += 1;
        if sent % 100 == 0 {
            info!("send: {} datagrams sent (alt={:.1}m)", sent, sample.barometric.altitude);
        }
    }

    info!("send: done, {} datagrams", sent);
    Ok(())
}
