use spilink_common::DeviceConfig;

pub const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>SpiLink TX</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    .muted{color:#555}td{padding:.2rem .6rem}
  </style>
</head>
<body>
  <h1>SpiLink TX</h1>
  <div class="card">
    <table>
      <tr><td>Frames sent</td><td id="tx">--</td></tr>
      <tr><td>SPI</td><td id="spi">--</td></tr>
      <tr><td>RSSI</td><td id="rssi">--</td></tr>
      <tr><td>MQTT</td><td id="mqtt">--</td></tr>
      <tr><td>Uptime</td><td id="uptime">--</td></tr>
      <tr><td>Free heap</td><td id="heap">--</td></tr>
    </table>
  </div>
  <p class="muted"><a href="/config">Configuration</a> &middot; <a href="/reboot">Reboot</a></p>
  <script>
    async function refresh(){
      const r=await fetch('/api/status');const s=await r.json();
      for(const k of ['tx','spi','rssi','mqtt','uptime','heap'])
        document.getElementById(k).textContent=String(s[k]);
    }
    refresh();setInterval(refresh,2000);
  </script>
</body>
</html>
"#;

const CONFIG_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>SpiLink TX Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password],input[type=number]{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}.muted{color:#555}
  </style>
</head>
<body>
  <h1>SpiLink TX Setup</h1>
  <p class="muted">The node reboots a few seconds after saving.</p>
  <form method="post" action="/save"
        onsubmit="for(const n of ['pass','mw']){const f=this.elements[n];f.disabled=!f.value;}">
    <label>WiFi SSID</label><input name="ssid" type="text" value="__SSID__">
    <label>WiFi Password (leave blank to keep current)</label><input name="pass" type="password">
    <label>MQTT Host (blank disables telemetry)</label><input name="ms" type="text" value="__HOST__">
    <label>MQTT Port</label><input name="mp" type="number" min="1" max="65535" value="__PORT__">
    <label>MQTT Topic</label><input name="mt" type="text" value="__TOPIC__">
    <label>MQTT Username</label><input name="mu" type="text" value="__USER__">
    <label>MQTT Password (leave blank to keep current)</label><input name="mw" type="password">
    <button type="submit">Save &amp; Reboot</button>
  </form>
</body>
</html>
"#;

pub const SAVED_HTML: &str =
    "<html><body><h1>Saved</h1><p>Configuration stored; rebooting in 3 seconds.</p></body></html>";
pub const REBOOT_HTML: &str = "<html><body><h1>Rebooting</h1></body></html>";

pub fn render_config_page(config: &DeviceConfig) -> String {
    CONFIG_HTML
        .replace("__SSID__", &escape_attr(&config.wifi_ssid))
        .replace("__HOST__", &escape_attr(&config.mqtt_host))
        .replace("__PORT__", &config.mqtt_port.to_string())
        .replace("__TOPIC__", &escape_attr(&config.mqtt_topic))
        .replace("__USER__", &escape_attr(&config.mqtt_user))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_page_prefills_and_escapes() {
        let mut config = DeviceConfig::default();
        config.wifi_ssid = "my \"net\" & co".to_string();
        config.mqtt_host = "broker.local".to_string();
        config.mqtt_topic = "spilink/tx".to_string();

        let page = render_config_page(&config);
        assert!(page.contains("value=\"my &quot;net&quot; &amp; co\""));
        assert!(page.contains("value=\"broker.local\""));
        assert!(page.contains("value=\"1883\""));
        assert!(!page.contains("__SSID__"));
    }

    #[test]
    fn blank_passwords_are_withheld_from_submission() {
        // A disabled control is not submitted, so an untouched password
        // field keeps the stored value instead of clearing it.
        assert!(CONFIG_HTML.contains("f.disabled=!f.value"));
        assert!(CONFIG_HTML.contains("['pass','mw']"));
    }

    #[test]
    fn password_fields_are_never_prefilled() {
        let mut config = DeviceConfig::default();
        config.wifi_pass = "secret".to_string();
        config.mqtt_pass = "secret2".to_string();

        let page = render_config_page(&config);
        assert!(!page.contains("secret"));
    }
}
