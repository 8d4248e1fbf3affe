/// Default CLIP content decoding: image resize + normalization and BPE
/// tokenization.
use crate::preprocess::{Decode, ItemContent};
use crate::ClipEmbeddingsError;
use clip_embeddings_backend::Tensor;
use image::imageops::FilterType;
use std::path::Path;
use tokenizers::tokenizer::Tokenizer;

pub const DEFAULT_IMAGE_SIZE: usize = 224;
pub const DEFAULT_CONTEXT_LENGTH: usize = 77;

// CLIP training statistics
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct ClipDecoder {
    tokenizer: Tokenizer,
    image_size: usize,
    context_length: usize,
}

impl ClipDecoder {
    pub fn new(tokenizer: Tokenizer, image_size: usize, context_length: usize) -> Self {
        Self {
            tokenizer,
            image_size,
            context_length,
        }
    }

    pub fn from_file<P: AsRef<Path>>(
        tokenizer_path: P,
        image_size: usize,
        context_length: usize,
    ) -> Result<Self, ClipEmbeddingsError> {
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
            ClipEmbeddingsError::Config(format!(
                "could not load tokenizer from {:?}: {err}",
                tokenizer_path.as_ref()
            ))
        })?;
        Ok(Self::new(tokenizer, image_size, context_length))
    }

    fn decode_image_bytes(&self, bytes: &[u8]) -> Result<Tensor, String> {
        let image = image::load_from_memory(bytes).map_err(|err| err.to_string())?;

        // Shortest side to `image_size`, then center crop
        let size = self.image_size as u32;
        let image = image
            .resize_to_fill(size, size, FilterType::CatmullRom)
            .to_rgb8();

        let hw = self.image_size * self.image_size;
        let mut data = vec![0.0; 3 * hw];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * self.image_size + x as usize;
            for channel in 0..3 {
                data[channel * hw + offset] =
                    (pixel[channel] as f32 / 255.0 - IMAGE_MEAN[channel]) / IMAGE_STD[channel];
            }
        }

        Ok(Tensor::Pixels {
            data,
            shape: [3, self.image_size, self.image_size],
        })
    }

    fn decode_image_array(&self, data: Vec<f32>, shape: [usize; 3]) -> Result<Tensor, String> {
        // Pre-supplied pixels must already be at the model shape; values are
        // expected in [0, 1] and only get normalized here
        let expected = [3, self.image_size, self.image_size];
        if shape != expected {
            return Err(format!(
                "pre-supplied tensor has shape {shape:?}, expected {expected:?}"
            ));
        }
        if data.len() != shape.iter().product::<usize>() {
            return Err(format!(
                "pre-supplied tensor has {} values, shape {shape:?} requires {}",
                data.len(),
                shape.iter().product::<usize>()
            ));
        }

        let hw = self.image_size * self.image_size;
        let data = data
            .into_iter()
            .enumerate()
            .map(|(i, v)| (v - IMAGE_MEAN[i / hw]) / IMAGE_STD[i / hw])
            .collect();

        Ok(Tensor::Pixels {
            data,
            shape: expected,
        })
    }

    fn decode_text(&self, text: &str) -> Result<Tensor, String> {
        if text.is_empty() {
            return Err("text content is empty".to_string());
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|err| err.to_string())?;

        let mut input_ids = encoding.get_ids().to_vec();
        input_ids.truncate(self.context_length);

        Ok(Tensor::TokenIds(input_ids))
    }
}

impl Decode for ClipDecoder {
    fn decode(&self, content: ItemContent) -> Result<Tensor, String> {
        match content {
            ItemContent::Text(text) => self.decode_text(&text),
            ItemContent::ImageBytes(bytes) => self.decode_image_bytes(&bytes),
            ItemContent::ImageArray { data, shape } => self.decode_image_array(data, shape),
        }
    }
}
