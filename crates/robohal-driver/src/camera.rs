//! # 相机
//!
//! 订阅原始图像主题，在回调中完成解码、颜色通道调整和旋转，
//! 缓冲中始终是可以直接使用的图像。

use crate::DeviceError;
use crate::config::CameraConfig;
use crate::session::{DeviceAdapter, DeviceSession, SessionConfig};
use bytes::Bytes;
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba, imageops};
use robohal_transport::{ImageMessage, Message, Transport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 输出颜色顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Rgb,
    Bgr,
}

/// 顺时针旋转
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Ccw90,
    Half,
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            -90 => Ok(Rotation::Ccw90),
            180 => Ok(Rotation::Half),
            other => Err(format!("rotation must be -90, 0, 90 or 180, got {}", other)),
        }
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Ccw90 => -90,
            Rotation::Half => 180,
        }
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
    Mono8,
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    /// 按编码名解析（如 "rgb8"）
    pub fn from_encoding(encoding: &str) -> Option<Self> {
        match encoding {
            "rgb8" => Some(Self::Rgb8),
            "bgr8" => Some(Self::Bgr8),
            "mono8" | "8UC1" => Some(Self::Mono8),
            "rgba8" => Some(Self::Rgba8),
            "bgra8" => Some(Self::Bgra8),
            _ => None,
        }
    }

    pub fn encoding(self) -> &'static str {
        match self {
            Self::Rgb8 => "rgb8",
            Self::Bgr8 => "bgr8",
            Self::Mono8 => "mono8",
            Self::Rgba8 => "rgba8",
            Self::Bgra8 => "bgra8",
        }
    }

    pub fn channels(self) -> usize {
        match self {
            Self::Mono8 => 1,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::Rgba8 | Self::Bgra8 => 4,
        }
    }

    /// 交换 R/B 通道后的格式（灰度不变）
    fn swapped(self) -> Self {
        match self {
            Self::Rgb8 => Self::Bgr8,
            Self::Bgr8 => Self::Rgb8,
            Self::Rgba8 => Self::Bgra8,
            Self::Bgra8 => Self::Rgba8,
            Self::Mono8 => Self::Mono8,
        }
    }

    fn color_mode(self) -> Option<ColorMode> {
        match self {
            Self::Rgb8 | Self::Rgba8 => Some(ColorMode::Rgb),
            Self::Bgr8 | Self::Bgra8 => Some(ColorMode::Bgr),
            Self::Mono8 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding())
    }
}

/// 解码后的图像（行紧密排列，height × width × channels）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 采集时间戳（微秒）
    pub stamp_us: u64,
    pub data: Bytes,
}

impl Image {
    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, self.channels())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let ch = self.channels();
        let offset = (y as usize * self.width as usize + x as usize) * ch;
        self.data.get(offset..offset + ch)
    }
}

/// 原始图像消息 → 紧密排列的图像，并按需要调整颜色顺序
pub fn decode_image(message: &ImageMessage, desired: ColorMode) -> Result<Image, DeviceError> {
    let format = PixelFormat::from_encoding(&message.encoding).ok_or_else(|| {
        DeviceError::Decode(format!("unsupported encoding '{}'", message.encoding))
    })?;

    let (width, height) = (message.width as usize, message.height as usize);
    let row = width * format.channels();
    let step = if message.step == 0 {
        row
    } else {
        message.step as usize
    };
    if step < row {
        return Err(DeviceError::Decode(format!(
            "row step {} is smaller than {} bytes per row",
            step, row
        )));
    }
    let needed = if height == 0 { 0 } else { step * (height - 1) + row };
    if message.data.len() < needed {
        return Err(DeviceError::Decode(format!(
            "image payload has {} bytes, expected at least {}",
            message.data.len(),
            needed
        )));
    }

    let needs_swap = format.color_mode().is_some_and(|mode| mode != desired);
    let data = if step == row && !needs_swap {
        message.data.slice(0..row * height)
    } else {
        let mut packed = Vec::with_capacity(row * height);
        for y in 0..height {
            packed.extend_from_slice(&message.data[y * step..y * step + row]);
        }
        if needs_swap {
            for px in packed.chunks_exact_mut(format.channels()) {
                px.swap(0, 2);
            }
        }
        Bytes::from(packed)
    };

    Ok(Image {
        width: message.width,
        height: message.height,
        format: if needs_swap { format.swapped() } else { format },
        stamp_us: message.stamp_us,
        data,
    })
}

/// 顺时针旋转图像
///
/// 数据长度与宽高不符时返回 [`DeviceError::Decode`]。
pub fn rotate_image(image: Image, rotation: Rotation) -> Result<Image, DeviceError> {
    if rotation == Rotation::None {
        return Ok(image);
    }

    let rotated = match image.channels() {
        1 => rotate_pixels::<Luma<u8>>(&image, rotation).map(into_parts),
        3 => rotate_pixels::<Rgb<u8>>(&image, rotation).map(into_parts),
        _ => rotate_pixels::<Rgba<u8>>(&image, rotation).map(into_parts),
    }
    .ok_or_else(|| {
        DeviceError::Decode(format!(
            "{}x{} {} image has {} bytes",
            image.width,
            image.height,
            image.format,
            image.data.len()
        ))
    })?;

    let (width, height, raw) = rotated;
    Ok(Image {
        width,
        height,
        data: Bytes::from(raw),
        ..image
    })
}

fn into_parts<P: Pixel<Subpixel = u8>>(buf: ImageBuffer<P, Vec<u8>>) -> (u32, u32, Vec<u8>) {
    (buf.width(), buf.height(), buf.into_raw())
}

fn rotate_pixels<P>(image: &Image, rotation: Rotation) -> Option<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let view = ImageBuffer::<P, &[u8]>::from_raw(image.width, image.height, &image.data[..])?;
    let rotated = match rotation {
        Rotation::Cw90 => imageops::rotate90(&view),
        Rotation::Ccw90 => imageops::rotate270(&view),
        Rotation::Half => imageops::rotate180(&view),
        Rotation::None => ImageBuffer::from_raw(image.width, image.height, image.data.to_vec())?,
    };
    Some(rotated)
}

/// 水平渐变：像素值 = (x + shift) mod 256，所有通道相同
fn gradient<P>(width: u32, height: u32, shift: u64) -> Vec<u8>
where
    P: Pixel<Subpixel = u8>,
{
    ImageBuffer::<P, Vec<u8>>::from_fn(width, height, |x, _| {
        let value = ((x as u64 + shift) % 256) as u8;
        *P::from_slice(&[value; 4][..P::CHANNEL_COUNT as usize])
    })
    .into_raw()
}

/// 相机适配器
#[derive(Debug)]
pub struct CameraAdapter {
    name: String,
    config: CameraConfig,
    mock_frames: AtomicU64,
}

impl CameraAdapter {
    pub fn new(name: impl Into<String>, config: CameraConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            mock_frames: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn check_dimensions(&self, message: &ImageMessage) -> Result<(), DeviceError> {
        let expected = (self.config.width, self.config.height);
        if let (Some(width), Some(height)) = expected
            && (message.width != width || message.height != height)
        {
            return Err(DeviceError::Decode(format!(
                "frame is {}x{}, camera is configured for {}x{}",
                message.width, message.height, width, height
            )));
        }
        Ok(())
    }

    /// 测试图案：水平渐变，每帧平移一个像素
    fn mock_frame(&self) -> ImageMessage {
        let width = self.config.width.unwrap_or(0);
        let height = self.config.height.unwrap_or(0);
        let ch = self.config.channels as usize;
        let frame = self.mock_frames.fetch_add(1, Ordering::Relaxed);
        let encoding = match (ch, self.config.color_mode) {
            (1, _) => "mono8",
            (4, ColorMode::Rgb) => "rgba8",
            (4, ColorMode::Bgr) => "bgra8",
            (_, ColorMode::Rgb) => "rgb8",
            (_, ColorMode::Bgr) => "bgr8",
        };

        let data = match ch {
            1 => gradient::<Luma<u8>>(width, height, frame),
            4 => gradient::<Rgba<u8>>(width, height, frame),
            _ => gradient::<Rgb<u8>>(width, height, frame),
        };

        ImageMessage {
            stamp_us: robohal_transport::current_time_us(),
            frame_id: self.name.clone(),
            width,
            height,
            encoding: encoding.to_string(),
            step: width * ch as u32,
            data: Bytes::from(data),
        }
    }

    fn transform(&self, message: &ImageMessage) -> Result<Image, DeviceError> {
        self.check_dimensions(message)?;
        let image = decode_image(message, self.config.color_mode)?;
        if image.channels() != self.config.channels as usize {
            return Err(DeviceError::Decode(format!(
                "frame has {} channels, camera is configured for {}",
                image.channels(),
                self.config.channels
            )));
        }
        rotate_image(image, self.config.rotation)
    }
}

impl DeviceAdapter for CameraAdapter {
    type Sample = Image;

    fn describe(&self) -> String {
        format!("Camera({}, {})", self.name, self.config.image_topic)
    }

    fn fps(&self) -> f64 {
        self.config.fps as f64
    }

    fn sample_topic(&self) -> &str {
        &self.config.image_topic
    }

    fn decode(&self, message: &Message) -> Result<Image, DeviceError> {
        match message {
            Message::Image(image) => self.transform(image),
            other => Err(DeviceError::Decode(format!(
                "expected an image message, got {}",
                other.kind()
            ))),
        }
    }

    fn pull(&self) -> Result<Option<Image>, DeviceError> {
        if !self.config.mock {
            return Ok(None);
        }
        self.transform(&self.mock_frame()).map(Some)
    }
}

/// 相机会话
pub type Camera = DeviceSession<CameraAdapter>;

impl DeviceSession<CameraAdapter> {
    pub fn from_config(
        name: impl Into<String>,
        config: CameraConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DeviceError> {
        let session_config = SessionConfig {
            connect_policy: config.connect_policy,
            ..Default::default()
        };
        let adapter = CameraAdapter::new(name, config)?;
        Ok(Self::with_config(adapter, transport, session_config))
    }
}

/// 按配置创建相机（键为相机名）
pub fn make_cameras_from_configs(
    configs: &BTreeMap<String, CameraConfig>,
    transport: Arc<dyn Transport>,
) -> Result<BTreeMap<String, Camera>, DeviceError> {
    configs
        .iter()
        .map(|(name, config)| {
            Camera::from_config(name.clone(), config.clone(), transport.clone())
                .map(|camera| (name.clone(), camera))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use robohal_transport::LoopbackTransport;
    use std::time::Duration;

    /// 2x3 RGB 图像，像素值 = 下标 * 10 + 通道
    fn rgb_message(width: u32, height: u32, step: u32) -> ImageMessage {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as u8;
                data.extend_from_slice(&[idx * 10, idx * 10 + 1, idx * 10 + 2]);
            }
            data.resize(((y + 1) * step) as usize, 0xEE);
        }
        ImageMessage {
            width,
            height,
            encoding: "rgb8".to_string(),
            step,
            data: Bytes::from(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_strips_row_padding() {
        let image = decode_image(&rgb_message(2, 3, 8), ColorMode::Rgb).unwrap();
        assert_eq!(image.shape(), (3, 2, 3));
        assert_eq!(image.data.len(), 18);
        assert_eq!(image.pixel(1, 2), Some(&[50u8, 51, 52][..]));
        assert_eq!(image.format, PixelFormat::Rgb8);
    }

    #[test]
    fn test_decode_swaps_to_bgr() {
        let image = decode_image(&rgb_message(2, 1, 6), ColorMode::Bgr).unwrap();
        assert_eq!(image.format, PixelFormat::Bgr8);
        assert_eq!(image.pixel(1, 0), Some(&[12u8, 11, 10][..]));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let mut msg = rgb_message(2, 3, 6);
        msg.data = msg.data.slice(0..10);
        assert!(matches!(decode_image(&msg, ColorMode::Rgb), Err(DeviceError::Decode(_))));

        let mut msg = rgb_message(2, 1, 6);
        msg.encoding = "yuv422".to_string();
        assert!(decode_image(&msg, ColorMode::Rgb).is_err());

        let mut msg = rgb_message(2, 1, 6);
        msg.step = 4;
        assert!(decode_image(&msg, ColorMode::Rgb).is_err());
    }

    #[test]
    fn test_mono_never_swapped() {
        let msg = ImageMessage {
            width: 2,
            height: 1,
            encoding: "mono8".to_string(),
            step: 2,
            data: Bytes::from_static(&[7, 9]),
            ..Default::default()
        };
        let image = decode_image(&msg, ColorMode::Bgr).unwrap();
        assert_eq!(image.format, PixelFormat::Mono8);
        assert_eq!(&image.data[..], &[7, 9]);
    }

    #[test]
    fn test_rotations() {
        // 2 宽 x 3 高，像素 (x, y) 的首通道为 (y * 2 + x) * 10
        let image = decode_image(&rgb_message(2, 3, 6), ColorMode::Rgb).unwrap();
        let first = |img: &Image, x, y| img.pixel(x, y).map(|p| p[0]);

        let cw = rotate_image(image.clone(), Rotation::Cw90).unwrap();
        assert_eq!((cw.width, cw.height), (3, 2));
        // 原左下角 (0, 2) 转到左上角
        assert_eq!(first(&cw, 0, 0), Some(40));
        assert_eq!(first(&cw, 2, 0), Some(0));

        let ccw = rotate_image(image.clone(), Rotation::Ccw90).unwrap();
        assert_eq!((ccw.width, ccw.height), (3, 2));
        // 原右上角 (1, 0) 转到左上角
        assert_eq!(first(&ccw, 0, 0), Some(10));

        let half = rotate_image(image.clone(), Rotation::Half).unwrap();
        assert_eq!(first(&half, 0, 0), Some(50));
        assert_eq!(first(&half, 1, 2), Some(0));

        // 顺时针再逆时针回到原图
        assert_eq!(rotate_image(cw, Rotation::Ccw90).unwrap(), image);
    }

    #[test]
    fn test_rotate_rejects_short_payload() {
        let image = Image {
            width: 3,
            height: 2,
            format: PixelFormat::Mono8,
            stamp_us: 0,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        assert!(matches!(
            rotate_image(image.clone(), Rotation::Half),
            Err(DeviceError::Decode(_))
        ));
        // 不旋转时原样返回
        assert_eq!(rotate_image(image.clone(), Rotation::None).unwrap(), image);
    }

    #[test]
    fn test_mock_frame_gradient() {
        let mut config = CameraConfig::new("/mock/image_raw");
        config.mock = true;
        config.width = Some(3);
        config.height = Some(2);
        config.channels = 4;
        let adapter = CameraAdapter::new("mock", config).unwrap();

        let first = adapter.mock_frame();
        assert_eq!(first.encoding, "rgba8");
        assert_eq!(first.data.len(), 24);
        assert_eq!(&first.data[4..8], &[1, 1, 1, 1]);
        // 下一帧整体平移一个像素
        let second = adapter.mock_frame();
        assert_eq!(&second.data[0..4], &[1, 1, 1, 1]);
    }

    #[test]
    fn test_rotation_serde_values() {
        assert_eq!(Rotation::try_from(-90), Ok(Rotation::Ccw90));
        assert!(Rotation::try_from(45).is_err());
        assert_eq!(i32::from(Rotation::Half), 180);
    }

    #[test]
    fn test_camera_callback_applies_transform() {
        let bus = LoopbackTransport::new();
        let mut config = CameraConfig::new("/front/image_raw");
        config.rotation = Rotation::Cw90;
        config.width = Some(2);
        config.height = Some(3);
        let camera = Camera::from_config("front", config, Arc::new(bus.clone())).unwrap();
        camera.connect().unwrap();

        bus.publish("/front/image_raw", Message::Image(rgb_message(2, 3, 6)))
            .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)));

        let image = camera.read().unwrap();
        assert_eq!(image.shape(), (2, 3, 3));

        // 尺寸不符视为解码失败，旧帧保留
        bus.publish("/front/image_raw", Message::Image(rgb_message(3, 3, 9)))
            .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)));
        assert_eq!(camera.read().unwrap(), image);
        assert_eq!(camera.metrics().decode_failures, 1);
    }

    #[test]
    fn test_mock_camera_generates_frames() {
        let bus = LoopbackTransport::new();
        let mut config = CameraConfig::new("/mock/image_raw");
        config.mock = true;
        config.width = Some(4);
        config.height = Some(2);
        config.fps = 50;
        let camera = Camera::from_config("mock", config, Arc::new(bus)).unwrap();
        camera.connect().unwrap();

        let image = camera.async_read(Duration::from_secs(1)).unwrap();
        assert_eq!(image.shape(), (2, 4, 3));
    }

    #[test]
    fn test_make_cameras_from_configs() {
        let bus: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let mut configs = BTreeMap::new();
        configs.insert("left".to_string(), CameraConfig::new("/left/image_raw"));
        configs.insert("right".to_string(), CameraConfig::new("/right/image_raw"));

        let cameras = make_cameras_from_configs(&configs, bus.clone()).unwrap();
        assert_eq!(cameras.len(), 2);
        assert!(cameras["left"].name().contains("/left/image_raw"));

        configs.insert("bad".to_string(), CameraConfig {
            fps: 0,
            ..CameraConfig::new("/bad")
        });
        assert!(make_cameras_from_configs(&configs, bus).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_rotations_compose(width in 1u32..6, height in 1u32..6, seed in 0u8..=255) {
            let data: Vec<u8> = (0..width * height * 3).map(|i| (i as u8).wrapping_add(seed)).collect();
            let image = Image {
                width,
                height,
                format: PixelFormat::Rgb8,
                stamp_us: 0,
                data: Bytes::from(data),
            };

            let quarter = rotate_image(image.clone(), Rotation::Cw90).unwrap();
            let half = rotate_image(quarter, Rotation::Cw90).unwrap();
            proptest::prop_assert_eq!(&half, &rotate_image(image.clone(), Rotation::Half).unwrap());

            let ccw = rotate_image(image.clone(), Rotation::Ccw90).unwrap();
            let back = rotate_image(ccw, Rotation::Cw90).unwrap();
            proptest::prop_assert_eq!(back, image);
        }
    }
}
