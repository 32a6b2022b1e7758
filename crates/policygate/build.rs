fn main() -> Result<(), Box<dyn std::error::Error>> {
	if std::env::var_os("PROTOC").is_none() {
		if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
			unsafe {
				std::env::set_var("PROTOC", protoc);
			}
		}
	}

	let proto_files = ["proto/ext_proc.proto"]
		.iter()
		.map(|name| std::env::current_dir().unwrap().join(name))
		.collect::<Vec<_>>();
	let include_dirs = ["proto/"]
		.iter()
		.map(|i| std::env::current_dir().unwrap().join(i))
		.collect::<Vec<_>>();

	let mut config = prost_build::Config::new();
	config.disable_comments(Some("."));

	tonic_build::configure()
		.build_server(true)
		.build_client(false)
		.compile_protos_with_config(
			config,
			&proto_files
				.iter()
				.map(|path| path.to_str().unwrap())
				.collect::<Vec<_>>(),
			&include_dirs
				.iter()
				.map(|p| p.to_str().unwrap())
				.collect::<Vec<_>>(),
		)?;

	for path in [proto_files, include_dirs].concat() {
		println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
	}
	Ok(())
}
