use std::env;

fn main() {
	let out_dir = env::var("OUT_DIR").unwrap();
	let profile_name = out_dir
		.split(std::path::MAIN_SEPARATOR)
		.nth_back(3)
		.unwrap_or("unknown")
		.to_string();
	let git_revision = env::var("POLICYGATE_GIT_REVISION").unwrap_or_else(|_| "unknown".into());

	println!("cargo:rustc-env=POLICYGATE_BUILD_GIT_REVISION={git_revision}");
	println!(
		"cargo:rustc-env=POLICYGATE_BUILD_RUSTC_VERSION={}",
		rustc_version::version().unwrap()
	);
	println!("cargo:rustc-env=POLICYGATE_BUILD_PROFILE_NAME={profile_name}");
	println!("cargo:rerun-if-env-changed=POLICYGATE_GIT_REVISION");
}
