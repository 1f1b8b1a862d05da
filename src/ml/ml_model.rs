//! 機械学習モデルの共通定義
//!
//! 家具分類用の転移学習モデル（バックボーン＋分類ヘッド）と入力前処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::model::BackboneKind;
use crate::types::NUM_CLASSES;

/// 標準バックボーンの出力チャネル数
pub const WIDE_CHANNELS: usize = 256;
/// 軽量バックボーンの出力チャネル数
pub const COMPACT_CHANNELS: usize = 64;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 特徴抽出に使うバックボーン
    pub backbone: BackboneKind,
    /// 分類クラス数
    #[config(default = 5)]
    pub num_classes: usize,
    /// 中間全結合層のユニット数
    #[config(default = 256)]
    pub hidden_size: usize,
    /// プーリング直後のドロップアウト率
    #[config(default = 0.3)]
    pub pool_dropout: f64,
    /// 中間層のドロップアウト率
    #[config(default = 0.4)]
    pub hidden_dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

/// 3x3 Conv (same padding) + ReLU + 2x2 MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

/// 標準バックボーン: 3 -> 32 -> 64 -> 128 -> 256
#[derive(Module, Debug)]
pub struct WideBackbone<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    block4: ConvBlock<B>,
}

impl<B: Backend> WideBackbone<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            block1: ConvBlock::new(3, 32, device),
            block2: ConvBlock::new(32, 64, device),
            block3: ConvBlock::new(64, 128, device),
            block4: ConvBlock::new(128, WIDE_CHANNELS, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        self.block4.forward(x)
    }
}

/// 軽量バックボーン: 3 -> 16 -> 32 -> 64
#[derive(Module, Debug)]
pub struct CompactBackbone<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
}

impl<B: Backend> CompactBackbone<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            block1: ConvBlock::new(3, 16, device),
            block2: ConvBlock::new(16, 32, device),
            block3: ConvBlock::new(32, COMPACT_CHANNELS, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        self.block3.forward(x)
    }
}

/// 分類器を組み立てる際のバックボーン
pub enum Backbone<B: Backend> {
    Wide(WideBackbone<B>),
    Compact(CompactBackbone<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn fresh(kind: BackboneKind, device: &B::Device) -> Self {
        match kind {
            BackboneKind::Wide => Backbone::Wide(WideBackbone::new(device)),
            BackboneKind::Compact => Backbone::Compact(CompactBackbone::new(device)),
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            Backbone::Wide(_) => BackboneKind::Wide,
            Backbone::Compact(_) => BackboneKind::Compact,
        }
    }

    /// 重みを固定する（勾配計算の対象外にする）
    pub fn frozen(self) -> Self {
        match self {
            Backbone::Wide(b) => Backbone::Wide(b.no_grad()),
            Backbone::Compact(b) => Backbone::Compact(b.no_grad()),
        }
    }
}

/// バックボーンごとの最小入力サイズ（プーリング後に1px以上残る大きさ）
pub fn min_image_size(kind: BackboneKind) -> usize {
    match kind {
        BackboneKind::Wide => 16,
        BackboneKind::Compact => 8,
    }
}

impl ModelConfig {
    /// 入力サイズがバックボーンに対して十分か確認する
    pub fn validate(&self) -> anyhow::Result<()> {
        let min = min_image_size(self.backbone);
        if self.image_size < min {
            anyhow::bail!(
                "入力サイズが小さすぎます: {} ({} バックボーンは最小{}x{}が必要)",
                self.image_size,
                self.backbone,
                min,
                min
            );
        }
        if self.num_classes != NUM_CLASSES {
            anyhow::bail!(
                "分類クラス数は{}である必要があります (指定: {})",
                NUM_CLASSES,
                self.num_classes
            );
        }
        Ok(())
    }

    /// 新規初期化したバックボーンでモデルを作る
    pub fn init<B: Backend>(&self, device: &B::Device) -> FurnitureClassifier<B> {
        self.init_with(Backbone::fresh(self.backbone, device), device)
    }

    /// 既存のバックボーンに分類ヘッドを載せてモデルを作る
    pub fn init_with<B: Backend>(&self, backbone: Backbone<B>, device: &B::Device) -> FurnitureClassifier<B> {
        let (wide, compact, channels) = match backbone {
            Backbone::Wide(b) => (Some(b), None, WIDE_CHANNELS),
            Backbone::Compact(b) => (None, Some(b), COMPACT_CHANNELS),
        };

        tracing::debug!(
            "Classifier: {} backbone ({} ch) -> GAP -> FC {} -> FC {}",
            self.backbone,
            channels,
            self.hidden_size,
            self.num_classes
        );

        FurnitureClassifier {
            wide,
            compact,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            pool_dropout: DropoutConfig::new(self.pool_dropout).init(),
            fc1: LinearConfig::new(channels, self.hidden_size).init(device),
            hidden_dropout: DropoutConfig::new(self.hidden_dropout).init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 家具分類モデル
///
/// # アーキテクチャ
/// - バックボーン（wide または compact のどちらか一方）
/// - Global Average Pooling
/// - Dropout(0.3)
/// - FC: channels -> 256 + ReLU
/// - Dropout(0.4)
/// - FC: 256 -> 5
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct FurnitureClassifier<B: Backend> {
    wide: Option<WideBackbone<B>>,
    compact: Option<CompactBackbone<B>>,

    pool: AdaptiveAvgPool2d,
    pool_dropout: Dropout,
    fc1: Linear<B>,
    hidden_dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> FurnitureClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = match (&self.wide, &self.compact) {
            (Some(backbone), _) => backbone.forward(images),
            (None, Some(backbone)) => backbone.forward(images),
            // 構築時にどちらか一方が必ず入る
            (None, None) => images,
        };

        let x = self.pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.pool_dropout.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.hidden_dropout.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    pub fn backbone_kind(&self) -> BackboneKind {
        if self.wide.is_some() {
            BackboneKind::Wide
        } else {
            BackboneKind::Compact
        }
    }

    /// 重みの読み込み後にバックボーンが残っているか
    ///
    /// 別のバックボーン構成のレコードを読み込むと両方が空になります。
    pub fn has_backbone(&self) -> bool {
        self.wide.is_some() || self.compact.is_some()
    }

    /// 分類ヘッドを外してバックボーンだけを取り出す
    pub fn into_backbone(self) -> Option<Backbone<B>> {
        match (self.wide, self.compact) {
            (Some(b), _) => Some(Backbone::Wide(b)),
            (None, Some(b)) => Some(Backbone::Compact(b)),
            (None, None) => None,
        }
    }
}

/// 画像を正方形にリサイズしてImageNetの平均・標準偏差で正規化する
///
/// 戻り値は (C, H, W) の順で平坦化されます。
pub fn normalize_rgb(img: &RgbImage, size: usize) -> Vec<f32> {
    let resized = if img.width() as usize == size && img.height() as usize == size {
        img.clone()
    } else {
        image::imageops::resize(img, size as u32, size as u32, FilterType::Triangle)
    };

    let mut data = Vec::with_capacity(3 * size * size);
    for channel in 0..3 {
        for pixel in resized.pixels() {
            let value = pixel[channel] as f32 / 255.0;
            data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
        }
    }
    data
}

pub fn normalize_image(img: &DynamicImage, size: usize) -> Vec<f32> {
    normalize_rgb(&img.to_rgb8(), size)
}
