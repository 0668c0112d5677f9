use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{
    image_to_tensor, pad_circular, select_best_device, tensor_to_image, DeviceMap,
    GenerationRequest, Loader, ModelLike, PaddingMode,
};

/// Weights are fixed; the whole point of this pipeline is one known-good
/// texture model, not a model zoo.
const WEIGHTS_REPO: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

const WIDTH: usize = 512;
const HEIGHT: usize = 512;
const DEFAULT_STEPS: usize = 50;
const DEFAULT_GUIDANCE: f64 = 7.5;
const DEFAULT_STRENGTH: f64 = 0.75;

const MAX_TOKENS: usize = 77;
const PAD_TOKEN: &str = "<|endoftext|>";
const VAE_SCALE: f64 = 0.18215;
/// Latent-space border (in latent pixels, 8 image pixels each) wrapped around
/// the sample before VAE decode so the decoder sees circular context.
const LATENT_PAD: usize = 8;

pub struct SdModel {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    text_encoder: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler_config: DDIMSchedulerConfig,
    padding_mode: PaddingMode,
}

impl ModelLike for SdModel {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE);

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.scheduler_config.build(steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let text_embeddings = self.text_embeddings(&request.prompt)?;

        // --- Initial latents: pure noise, or the encoded init image noised
        // up to the requested strength ---
        let (mut latents, t_start) = match &request.init_image {
            Some(path) => {
                let strength = request.strength.unwrap_or(DEFAULT_STRENGTH);
                if !(0. ..=1.).contains(&strength) {
                    anyhow::bail!("strength must be between 0 and 1, got {strength}")
                }
                let init_image = image_to_tensor(path, WIDTH, HEIGHT)?
                    .to_device(&self.device)?
                    .to_dtype(self.dtype)?;
                let latent_dist = self.vae.encode(&init_image)?;
                let latents = (latent_dist.sample()? * VAE_SCALE)?;
                let t_start = steps - (steps as f64 * strength) as usize;
                let latents = if t_start < timesteps.len() {
                    let noise = latents.randn_like(0f64, 1f64)?;
                    scheduler.add_noise(&latents, noise, timesteps[t_start])?
                } else {
                    latents
                };
                (latents, t_start)
            }
            None => {
                let latents = Tensor::randn(
                    0f32,
                    1f32,
                    (1, 4, HEIGHT / 8, WIDTH / 8),
                    &self.device,
                )?
                .to_dtype(self.dtype)?;
                // scale the initial noise by the standard deviation required
                // by the scheduler
                ((latents * scheduler.init_noise_sigma())?, 0)
            }
        };

        // --- Denoising loop with classifier-free guidance ---
        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&chunks[0], &chunks[1]);
            let noise_pred = (uncond + ((cond - uncond)? * guidance)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        println!("Generated latent image");

        let image = self.decode_latents(&latents)?;
        println!("Decoded image");
        Ok(image)
    }
}

impl SdModel {
    /// CLIP embeddings for the prompt, stacked under the unconditional
    /// embedding for classifier-free guidance.
    fn text_embeddings(&self, prompt: &str) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let uncond = self.encode_prompt("")?;
        let embeddings = Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?;
        Ok(embeddings)
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let pad_id = self
            .tokenizer
            .get_vocab(true)
            .get(PAD_TOKEN)
            .copied()
            .unwrap_or(49407);
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > MAX_TOKENS {
            anyhow::bail!(
                "the prompt is too long, {} tokens > {MAX_TOKENS}",
                tokens.len()
            )
        }
        tokens.resize(MAX_TOKENS, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }

    /// VAE decode, in circular mode over a wrapped latent so the borders of
    /// the output continue into each other; the decoded image is cropped
    /// back to the nominal extent.
    fn decode_padded(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / VAE_SCALE)?;
        let decoded = match self.padding_mode {
            PaddingMode::Zeros => self.vae.decode(&latents)?,
            PaddingMode::Circular => {
                let padded = pad_circular(&latents, LATENT_PAD)?;
                let decoded = self.vae.decode(&padded)?;
                let (_, _, h, w) = decoded.dims4()?;
                let crop = LATENT_PAD * 8;
                decoded
                    .narrow(2, crop, h - 2 * crop)?
                    .narrow(3, crop, w - 2 * crop)?
            }
        };
        Ok(decoded)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<DynamicImage> {
        let decoded = self.decode_padded(latents)?;
        let image = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&image.i(0)?)
    }

    pub fn padding_mode(&self) -> PaddingMode {
        self.padding_mode
    }
}

pub struct SdLoader;

impl Loader for SdLoader {
    type Model = SdModel;

    async fn load(api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = DType::F16;
        let sd_config = StableDiffusionConfig::v1_5(None, Some(HEIGHT), Some(WIDTH));

        let repo = api.repo(hf_hub::Repo::model(WEIGHTS_REPO.to_string()));

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let clip_weights = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get CLIP weights")?;
        // the text encoder stays in f32, embeddings are cast afterwards
        let text_encoder =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, &device, DType::F32)
                .context("failed to build CLIP transformer")?;

        let vae_weights = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE weights")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to build autoencoder")?;

        let unet_weights = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;
        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet = match sd_config.build_unet(&unet_weights, &device, 4, use_flash_attn, dtype) {
            Ok(unet) => unet,
            Err(err) if use_flash_attn => {
                println!("Flash attention not available ({err}), using standard attention");
                sd_config
                    .build_unet(&unet_weights, &device, 4, false, dtype)
                    .context("failed to build UNet")?
            }
            Err(err) => return Err(Error::new(err).context("failed to build UNet")),
        };

        Ok(SdModel {
            device,
            dtype,
            tokenizer,
            text_encoder,
            unet,
            vae,
            scheduler_config: DDIMSchedulerConfig::default(),
            padding_mode: PaddingMode::default(),
        })
    }
}
