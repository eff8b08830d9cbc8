#![no_std]
#![no_main]

use dali_bridge::adapter::{DaliAdapter, DriverLink};
use dali_bridge::bus::{BusChannels, BusDriver, BusPhy};
use dali_bridge::configuration::BridgeConfig;
use dali_bridge::controller::Controller;
use dali_bridge::error::{DaliError, Result};
use dali_bridge::protocol::codec::{Level as LineLevel, Pulse, PulseBuffer};
use dali_bridge::protocol::constants::{RX_IDLE_THRESHOLD, T_BUS_FAILURE_MIN};
use dali_bridge::registry::Registry;
use dali_bridge::storage::MemoryStore;
use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_rp::clocks::RoscRng;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use panic_persist as _;
use static_cell::StaticCell;

#[cfg(feature = "usb-logger")]
use embassy_rp::bind_interrupts;
#[cfg(feature = "usb-logger")]
use embassy_rp::peripherals::USB;
#[cfg(feature = "usb-logger")]
use embassy_rp::usb::{Driver, InterruptHandler as UsbInterruptHandler};

// Program metadata for `picotool info`
#[unsafe(link_section = ".bi_entries")]
#[used]
pub static PICOTOOL_ENTRIES: [embassy_rp::binary_info::EntryAddr; 4] = [
    embassy_rp::binary_info::rp_program_name!(c"DALI-BRIDGE"),
    embassy_rp::binary_info::rp_program_description!(
        c"DALI (IEC 62386) bus engine for Raspberry Pico 2"
    ),
    embassy_rp::binary_info::rp_cargo_version!(),
    embassy_rp::binary_info::rp_program_build_attribute!(),
];

#[cfg(feature = "usb-logger")]
bind_interrupts!(struct UsbIrqs {
    USBCTRL_IRQ => UsbInterruptHandler<USB>;
});

/// Pins wired to the bus interface on the reference board
const BOARD_TX_PIN: u8 = 17;
const BOARD_RX_PIN: u8 = 16;

/// The receive optocoupler pulls the RX pin low while the bus is active
const RX_ACTIVE_LOW: bool = true;

type RawMutex = CriticalSectionRawMutex;
type Link = DriverLink<'static, RawMutex, RoscRng>;
type BridgeController = Controller<'static, RawMutex, Link, MemoryStore>;

static CHANNELS: BusChannels<RawMutex> = BusChannels::new();

/// Transmit side of the bus interface: TX high sinks bus current.
struct GpioPhy {
    tx: Output<'static>,
}

impl BusPhy for GpioPhy {
    async fn transmit(&mut self, pulses: &[Pulse]) -> Result<()> {
        for pulse in pulses {
            match pulse.level {
                LineLevel::Active => self.tx.set_high(),
                LineLevel::Idle => self.tx.set_low(),
            }
            Timer::after_micros(u64::from(pulse.duration_us)).await;
        }
        self.tx.set_low();
        Ok(())
    }
}

fn line_level(rx: &Input<'static>) -> LineLevel {
    if rx.is_low() == RX_ACTIVE_LOW {
        LineLevel::Active
    } else {
        LineLevel::Idle
    }
}

/// The firmware only knows the reference board wiring.
fn check_pins(config: &BridgeConfig) -> Result<()> {
    if config.tx_pin != BOARD_TX_PIN || config.rx_pin != BOARD_RX_PIN {
        error!(
            "Configured pins TX={} RX={} do not match the board (TX={} RX={})",
            config.tx_pin, config.rx_pin, BOARD_TX_PIN, BOARD_RX_PIN
        );
        return Err(DaliError::HardwareInit);
    }
    Ok(())
}

/// Entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    #[cfg(feature = "usb-logger")]
    spawner.must_spawn(logger_task(Driver::new(p.USB, UsbIrqs)));

    if let Some(panic_message) = panic_persist::get_panic_message_utf8() {
        error!("Previous run panicked: {}", panic_message);
    }

    let config = match BridgeConfig::load().and_then(|config| check_pins(&config).map(|()| config)) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:?}", e);
            loop {
                Timer::after_secs(5).await;
            }
        }
    };
    info!("Configuration: {:?}", config);

    let tx = Output::new(p.PIN_17, Level::Low);
    let rx = Input::new(p.PIN_16, Pull::None);

    spawner.must_spawn(driver_task(BusDriver::new(&CHANNELS, GpioPhy { tx })));
    spawner.must_spawn(receive_task(rx));
    spawner.must_spawn(router_task());

    static REGISTRY: StaticCell<Registry<RawMutex>> = StaticCell::new();
    static ADAPTER: StaticCell<DaliAdapter<RawMutex, Link>> = StaticCell::new();
    static CONTROLLER: StaticCell<BridgeController> = StaticCell::new();

    let registry = REGISTRY.init(Registry::new());
    let adapter = ADAPTER.init(DaliAdapter::new(DriverLink::new(&CHANNELS, RoscRng)));
    let controller: &'static BridgeController =
        CONTROLLER.init(Controller::new(adapter, registry, MemoryStore::new(), config));

    if let Err(e) = controller.init().await {
        error!("Startup scan failed: {:?}", e);
    }
    let (gear, inputs) = registry.counts();
    info!("DALI bridge ready: {} control gear, {} input devices", gear, inputs);

    spawner.must_spawn(scheduler_task(controller));
    spawner.must_spawn(sniffer_task(controller));
    spawner.must_spawn(persistence_task(controller));
    spawner.must_spawn(command_task(controller));

    // Hand-off point for the messaging side
    loop {
        let notification = registry.next_notification().await;
        info!("{:?}", notification);
    }
}

#[embassy_executor::task]
async fn driver_task(mut driver: BusDriver<'static, RawMutex, GpioPhy>) -> ! {
    driver.run().await
}

/// Capture edges into bursts and hand them to the driver.
///
/// A burst ends when the line has been idle for longer than any pulse of
/// a frame, or active long enough to count as a bus failure.
#[embassy_executor::task]
async fn receive_task(mut rx: Input<'static>) -> ! {
    loop {
        rx.wait_for_any_edge().await;
        let mut start = Instant::now();
        CHANNELS.record_edge(start.as_micros());
        let mut level = line_level(&rx);
        let mut burst = PulseBuffer::new();

        loop {
            let limit = match level {
                LineLevel::Active => T_BUS_FAILURE_MIN,
                LineLevel::Idle => RX_IDLE_THRESHOLD,
            };
            let edge = with_timeout(Duration::from_micros(u64::from(limit)), rx.wait_for_any_edge()).await;
            let now = Instant::now();
            let pulse = Pulse {
                level,
                duration_us: (now - start).as_micros() as u32,
            };
            if burst.push(pulse).is_err() || edge.is_err() {
                break;
            }
            CHANNELS.record_edge(now.as_micros());
            start = now;
            level = line_level(&rx);
        }

        if !CHANNELS.post_burst(burst) {
            warn!("Receive burst dropped, driver is behind");
        }
    }
}

#[embassy_executor::task]
async fn router_task() -> ! {
    CHANNELS.route_events().await
}

#[embassy_executor::task]
async fn scheduler_task(controller: &'static BridgeController) -> ! {
    controller.run_scheduler().await
}

#[embassy_executor::task]
async fn sniffer_task(controller: &'static BridgeController) -> ! {
    controller.run_sniffer(&CHANNELS).await
}

#[embassy_executor::task]
async fn persistence_task(controller: &'static BridgeController) -> ! {
    controller.run_persistence().await
}

#[embassy_executor::task]
async fn command_task(controller: &'static BridgeController) -> ! {
    controller.run_commands().await
}

#[cfg(feature = "usb-logger")]
#[embassy_executor::task]
async fn logger_task(driver: Driver<'static, USB>) {
    embassy_usb_logger::run!(1024, log::LevelFilter::Info, driver);
}
