// Touch and key input, expressed as allow-listed device shell commands.
use std::time::Duration;

use crate::device::DeviceControl;
use crate::errors::DroidClawResult;

pub const KEYCODE_HOME: u32 = 3;
pub const KEYCODE_BACK: u32 = 4;
pub const KEYCODE_ENTER: u32 = 66;

pub async fn tap(device: &dyn DeviceControl, x: i32, y: i32) -> DroidClawResult<()> {
    device.shell(&format!("input tap {x} {y}")).await?;
    Ok(())
}

pub async fn double_tap(device: &dyn DeviceControl, x: i32, y: i32, gap: Duration) -> DroidClawResult<()> {
    tap(device, x, y).await?;
    tokio::time::sleep(gap).await;
    tap(device, x, y).await
}

/// A zero-distance drag held for `hold`.
pub async fn long_press(device: &dyn DeviceControl, x: i32, y: i32, hold: Duration) -> DroidClawResult<()> {
    swipe(device, (x, y), (x, y), hold).await
}

pub async fn swipe(
    device: &dyn DeviceControl,
    from: (i32, i32),
    to: (i32, i32),
    duration: Duration,
) -> DroidClawResult<()> {
    device
        .shell(&format!(
            "input swipe {} {} {} {} {}",
            from.0,
            from.1,
            to.0,
            to.1,
            duration.as_millis()
        ))
        .await?;
    Ok(())
}

pub async fn key_event(device: &dyn DeviceControl, keycode: u32) -> DroidClawResult<()> {
    device.shell(&format!("input keyevent {keycode}")).await?;
    Ok(())
}

pub async fn launch_package(device: &dyn DeviceControl, package: &str) -> DroidClawResult<()> {
    device
        .shell(&format!(
            "monkey -p {package} -c android.intent.category.LAUNCHER 1"
        ))
        .await?;
    Ok(())
}
