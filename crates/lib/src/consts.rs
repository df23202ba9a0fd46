/// Name of the builder binary installed into every layer build.
pub const BUILDER_BIN_NAME: &str = "flynn-builder";

/// Where the staging directory is mounted inside the build container.
pub const CONTAINER_MOUNT_DIR: &str = "/mnt";

/// Layer blob written by the build command, relative to the staging directory.
pub const LAYER_OUTPUT_PATH: &str = "out/layer.squashfs";

pub const DEFAULT_CACHE_DIR: &str = "/var/lib/flynn/layer-cache";
pub const DEFAULT_MANIFEST_PATH: &str = "builder/manifest.json";
pub const DEFAULT_BUILD_DIR: &str = "build";
pub const DEFAULT_EXTERNAL_IP: &str = "127.0.0.1";
pub const DEFAULT_HOST_URL: &str = "http://192.0.2.100:1113";
pub const DEFAULT_VERSION: &str = "dev";

/// Go import path prefix that maps onto the workspace root.
pub const DEFAULT_GO_MODULE: &str = "github.com/flynn/flynn";

/// Image injected as `build_with` for layers that compile Go code.
pub const GO_IMAGE: &str = "go";

pub const DEFAULT_GOOS: &str = "linux";
pub const DEFAULT_GOARCH: &str = "amd64";

/// Entrypoint key used for an image's default entrypoint.
pub const DEFAULT_ENTRYPOINT: &str = "_default";
