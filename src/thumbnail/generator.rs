use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageError, ImageFormat, imageops::FilterType};
use std::io::Cursor;

/// 缩略图生成结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// 原图宽度
    pub width: u32,
    /// 原图高度
    pub height: u32,
    /// base64 编码的 PNG 预览图
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("corrupt image data: {0}")]
    Corrupt(String),

    #[error("failed to encode thumbnail: {0}")]
    Encode(String),
}

impl ThumbnailError {
    fn from_decode(err: ImageError) -> Self {
        match err {
            ImageError::Unsupported(_) => ThumbnailError::UnsupportedFormat,
            other => ThumbnailError::Corrupt(other.to_string()),
        }
    }
}

/// 缩略图生成器
///
/// 纯函数:输入原图字节,输出原图尺寸与限定在 `max_size` 方框内的 PNG 预览。
/// 缩放使用固定的 Triangle 滤波器,相同输入总得到相同输出。
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailGenerator {
    max_size: u32,
}

impl ThumbnailGenerator {
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size: max_size.max(1),
        }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn generate(&self, bytes: &[u8]) -> Result<Thumbnail, ThumbnailError> {
        let format = image::guess_format(bytes).map_err(|_| ThumbnailError::UnsupportedFormat)?;
        if !format.reading_enabled() {
            return Err(ThumbnailError::UnsupportedFormat);
        }

        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(ThumbnailError::from_decode)?;

        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(ThumbnailError::Corrupt("image has no pixels".to_string()));
        }

        let data = self.encode_preview(&image)?;
        Ok(Thumbnail {
            width,
            height,
            data,
        })
    }

    /// 计算缩略图尺寸:保持宽高比,不放大,最长边不超过 `max_size`
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height);
        if longest <= self.max_size {
            return (width, height);
        }

        let scale = self.max_size as f64 / longest as f64;
        let w = ((width as f64 * scale).round() as u32).clamp(1, self.max_size);
        let h = ((height as f64 * scale).round() as u32).clamp(1, self.max_size);
        (w, h)
    }

    fn encode_preview(&self, image: &DynamicImage) -> Result<String, ThumbnailError> {
        let (w, h) = self.fit(image.width(), image.height());
        let preview = if (w, h) == (image.width(), image.height()) {
            image.to_rgba8()
        } else {
            image::imageops::resize(&image.to_rgba8(), w, h, FilterType::Triangle)
        };

        let mut buf = Cursor::new(Vec::new());
        preview
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| ThumbnailError::Encode(e.to_string()))?;

        Ok(STANDARD.encode(buf.into_inner()))
    }
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
